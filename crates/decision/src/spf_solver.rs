//! Per-prefix best-route selection and next-hop derivation.
//!
//! For every prefix the solver filters advertisements down to reachable,
//! least-drained originators, selects the best set by comparable metrics,
//! computes next hops per area under that area's forwarding algorithm,
//! and emits a [`RibUnicastEntry`]. It also derives MPLS label routes for
//! node segment labels and local adjacency labels.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv6Addr};

use tracing::{debug, error, info, warn};
use trellis_types::config::DecisionConfig;
use trellis_types::metrics::SharedMetricSink;
use trellis_types::{
    ForwardingAlgorithm, ForwardingType, IpPrefix, MplsAction, NextHop, PrefixEntry, RibMplsEntry,
    RibUnicastEntry, is_mpls_label_valid,
};

use crate::link::{LinkId, LinkStateMetric};
use crate::link_state::LinkState;
use crate::prefix_state::{NodeAndArea, PrefixState};
use crate::route_db::RouteDb;

const METRIC_ROUTE_BUILD_RUNS: &str = "decision_route_build_runs_total";
const METRIC_GET_ROUTE_FOR_PREFIX: &str = "decision_get_route_for_prefix_total";
const METRIC_NO_ROUTE_TO_PREFIX: &str = "decision_no_route_to_prefix_total";
const METRIC_NO_ROUTE_TO_LABEL: &str = "decision_no_route_to_label_total";
const METRIC_SKIPPED_UNICAST_ROUTE: &str = "decision_skipped_unicast_route_total";
const METRIC_SKIPPED_MPLS_ROUTE: &str = "decision_skipped_mpls_route_total";
const METRIC_DUPLICATE_NODE_LABEL: &str = "decision_duplicate_node_label_total";
const METRIC_INCOMPATIBLE_FORWARDING_TYPE: &str = "decision_incompatible_forwarding_type_total";

/// Advertisements for one prefix, keyed by `(node, area)`.
pub type PrefixEntries = BTreeMap<NodeAndArea, PrefixEntry>;

/// Outcome of best-route selection for one prefix.
#[derive(Debug, Clone, Default)]
pub struct RouteSelectionResult {
    /// The full equal-preference set of advertising `(node, area)` pairs.
    pub all_node_areas: BTreeSet<NodeAndArea>,
    /// The single winner (lowest originator among the best).
    pub best_node_area: NodeAndArea,
    /// True when the winner is hard- or soft-drained.
    pub is_best_node_drained: bool,
}

impl RouteSelectionResult {
    /// True when `node` (in any area) is among the selected originators.
    pub fn has_node(&self, node: &str) -> bool {
        self.all_node_areas.iter().any(|(n, _)| n == node)
    }
}

/// Next-hop computation result for one area.
struct SpfAreaResults {
    best_metric: LinkStateMetric,
    next_hops: BTreeSet<NextHop>,
}

/// The route computation engine.
pub struct SpfSolver {
    my_node_name: String,
    config: DecisionConfig,
    static_unicast_routes: BTreeMap<IpPrefix, RibUnicastEntry>,
    best_routes_cache: BTreeMap<IpPrefix, RouteSelectionResult>,
    metrics: SharedMetricSink,
}

impl SpfSolver {
    /// Creates a solver for the local node.
    pub fn new(
        my_node_name: impl Into<String>,
        config: DecisionConfig,
        metrics: SharedMetricSink,
    ) -> Self {
        Self {
            my_node_name: my_node_name.into(),
            config,
            static_unicast_routes: BTreeMap::new(),
            best_routes_cache: BTreeMap::new(),
            metrics,
        }
    }

    /// Overlays static unicast routes. They have lower priority than
    /// computed routes: a computed route for the same prefix wins.
    pub fn update_static_unicast_routes(
        &mut self,
        to_update: BTreeMap<IpPrefix, RibUnicastEntry>,
        to_delete: Vec<IpPrefix>,
    ) {
        if !to_update.is_empty() {
            info!(count = to_update.len(), "adding/updating static unicast routes");
        }
        for (prefix, entry) in to_update {
            self.static_unicast_routes.insert(prefix, entry);
        }
        if !to_delete.is_empty() {
            info!(count = to_delete.len(), "deleting static unicast routes");
        }
        for prefix in to_delete {
            self.static_unicast_routes.remove(&prefix);
        }
    }

    /// Best-route selection of the last computation, for introspection.
    pub fn best_routes_cache(&self) -> &BTreeMap<IpPrefix, RouteSelectionResult> {
        &self.best_routes_cache
    }

    /// Builds the full route database from the current link and prefix
    /// state. Returns `None` until the local node appears in some area's
    /// topology.
    pub fn build_route_db(
        &mut self,
        areas: &mut BTreeMap<String, LinkState>,
        prefix_state: &PrefixState,
    ) -> Option<RouteDb> {
        if !areas.values().any(|ls| ls.has_node(&self.my_node_name)) {
            return None;
        }
        self.metrics.increment(METRIC_ROUTE_BUILD_RUNS, 1);

        let mut route_db = RouteDb::new();
        self.best_routes_cache.clear();

        let prefixes: Vec<IpPrefix> = prefix_state.prefixes().keys().copied().collect();
        for prefix in prefixes {
            if let Some(entry) = self.create_route_for_prefix(areas, prefix_state, prefix) {
                route_db.add_unicast_route(entry);
            }
        }

        // Static routes fill in only where no route was computed.
        for (prefix, entry) in &self.static_unicast_routes {
            if !route_db.unicast_routes.contains_key(prefix) {
                route_db.add_unicast_route(entry.clone());
            }
        }

        if self.config.enable_node_segment_label {
            for entry in self.node_segment_label_routes(areas) {
                route_db.add_mpls_route(entry);
            }
        }
        if self.config.enable_adjacency_labels {
            for entry in self.adjacency_label_routes(areas) {
                route_db.add_mpls_route(entry);
            }
        }

        Some(route_db)
    }

    /// Computes the route for one prefix, if any.
    pub fn create_route_for_prefix(
        &mut self,
        areas: &mut BTreeMap<String, LinkState>,
        prefix_state: &PrefixState,
        prefix: IpPrefix,
    ) -> Option<RibUnicastEntry> {
        self.metrics.increment(METRIC_GET_ROUTE_FOR_PREFIX, 1);

        if prefix.is_v4() && !self.config.enable_v4 && !self.config.v4_over_v6_nexthop {
            warn!(%prefix, "skipping v4 prefix: v4 disabled and v4-over-v6 not configured");
            self.metrics.increment(METRIC_SKIPPED_UNICAST_ROUTE, 1);
            return None;
        }

        let mut prefix_entries: PrefixEntries = prefix_state.prefixes().get(&prefix)?.clone();
        self.best_routes_cache.remove(&prefix);

        // Keep only advertisements from nodes reachable within their own
        // area.
        prefix_entries.retain(|(node, area), _| match areas.get_mut(area) {
            Some(link_state) => {
                link_state.get_spf_result(&self.my_node_name, true).contains_key(node)
            }
            None => false,
        });
        if prefix_entries.is_empty() {
            debug!(%prefix, "skipping route with no reachable advertising node");
            self.metrics.increment(METRIC_NO_ROUTE_TO_PREFIX, 1);
            return None;
        }

        let selection = self.select_best_routes(&prefix_entries, areas);
        if selection.all_node_areas.is_empty() {
            warn!(%prefix, "no route to prefix after selection");
            self.metrics.increment(METRIC_NO_ROUTE_TO_PREFIX, 1);
            return None;
        }
        self.best_routes_cache.insert(prefix, selection.clone());

        // Never install routes toward prefixes we advertise ourselves.
        if selection.has_node(&self.my_node_name) {
            debug!(%prefix, "skipping prefix advertised by the local node");
            return None;
        }

        // Per-area next-hop computation under the area's forwarding
        // algorithm; only areas with globally minimal metric contribute
        // SP next hops.
        let mut total_next_hops: BTreeSet<NextHop> = BTreeSet::new();
        let mut ksp2_next_hops: BTreeSet<NextHop> = BTreeSet::new();
        let mut shortest_metric = LinkStateMetric::MAX;

        let area_names: Vec<String> = areas.keys().cloned().collect();
        for area in area_names {
            let Some((forwarding_type, algorithm)) =
                Self::area_forwarding_rules(&prefix_entries, &selection, &area)
            else {
                continue;
            };
            let Some(link_state) = areas.get_mut(&area) else { continue };

            match algorithm {
                ForwardingAlgorithm::SpEcmp
                | ForwardingAlgorithm::SpUcmpAdjWeightPropagation
                | ForwardingAlgorithm::SpUcmpPrefixWeightPropagation => {
                    let results = self.select_best_paths_spf(prefix, &selection, &area, link_state);
                    if results.next_hops.is_empty() {
                        continue;
                    }
                    if shortest_metric >= results.best_metric {
                        if shortest_metric > results.best_metric {
                            shortest_metric = results.best_metric;
                            total_next_hops.clear();
                        }
                        total_next_hops.extend(results.next_hops);
                    }
                }
                ForwardingAlgorithm::Ksp2EdEcmp => {
                    ksp2_next_hops.extend(self.select_best_paths_ksp2(
                        prefix,
                        &selection,
                        forwarding_type,
                        &area,
                        link_state,
                    ));
                }
            }
        }
        total_next_hops.extend(ksp2_next_hops);

        self.add_best_paths(prefix, &selection, &prefix_entries, total_next_hops, shortest_metric)
    }

    /// Selects the best advertisements for a prefix: drain filters first,
    /// then the comparable-metrics tuple, with the lowest originator as
    /// the single winner.
    fn select_best_routes(
        &self,
        prefix_entries: &PrefixEntries,
        areas: &BTreeMap<String, LinkState>,
    ) -> RouteSelectionResult {
        let mut result = RouteSelectionResult::default();
        let filtered = Self::filter_drained_nodes(prefix_entries, areas);

        if self.config.enable_best_route_selection {
            // Lower tuple wins: drained last, higher preferences first,
            // shorter re-advertisement distance first.
            let metrics_key = |entry: &PrefixEntry| {
                (
                    entry.metrics.drain_metric,
                    -entry.metrics.path_preference,
                    -entry.metrics.source_preference,
                    entry.metrics.distance,
                )
            };
            if let Some(best) = filtered.values().map(|e| metrics_key(e)).min() {
                result.all_node_areas = filtered
                    .iter()
                    .filter(|(_, entry)| metrics_key(entry) == best)
                    .map(|(node_area, _)| node_area.clone())
                    .collect();
            }
        } else {
            result.all_node_areas = filtered.keys().cloned().collect();
        }

        if let Some(best) = result.all_node_areas.iter().min().cloned() {
            result.is_best_node_drained = Self::is_node_drained(&best, areas);
            result.best_node_area = best;
        }
        result
    }

    /// Drops hard-drained originators (unless all are), then keeps only
    /// the least soft-drained remainder.
    fn filter_drained_nodes(
        prefix_entries: &PrefixEntries,
        areas: &BTreeMap<String, LinkState>,
    ) -> PrefixEntries {
        let hard_filtered: PrefixEntries = {
            let filtered: PrefixEntries = prefix_entries
                .iter()
                .filter(|((node, area), _)| {
                    !areas.get(area).is_some_and(|ls| ls.is_node_overloaded(node))
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if filtered.is_empty() { prefix_entries.clone() } else { filtered }
        };

        let min_soft_drain = hard_filtered
            .keys()
            .map(|(node, area)| {
                areas.get(area).map_or(0, |ls| ls.get_node_metric_increment(node))
            })
            .min()
            .unwrap_or(0);
        hard_filtered
            .into_iter()
            .filter(|((node, area), _)| {
                areas.get(area).map_or(0, |ls| ls.get_node_metric_increment(node))
                    == min_soft_drain
            })
            .collect()
    }

    fn is_node_drained(node_area: &NodeAndArea, areas: &BTreeMap<String, LinkState>) -> bool {
        let (node, area) = node_area;
        areas.get(area).is_some_and(|ls| {
            ls.is_node_overloaded(node) || ls.get_node_metric_increment(node) != 0
        })
    }

    /// Forwarding rules for a prefix in one area: the consistent
    /// `(type, algorithm)` of the selected advertisements in that area.
    /// When advertisements disagree the greatest pair wins.
    fn area_forwarding_rules(
        prefix_entries: &PrefixEntries,
        selection: &RouteSelectionResult,
        area: &str,
    ) -> Option<(ForwardingType, ForwardingAlgorithm)> {
        selection
            .all_node_areas
            .iter()
            .filter(|(_, entry_area)| entry_area == area)
            .filter_map(|node_area| prefix_entries.get(node_area))
            .map(|entry| (entry.forwarding_type, entry.forwarding_algorithm))
            .max()
    }

    /// Shortest-path next hops toward the selected originators within one
    /// area.
    fn select_best_paths_spf(
        &self,
        prefix: IpPrefix,
        selection: &RouteSelectionResult,
        area: &str,
        link_state: &mut LinkState,
    ) -> SpfAreaResults {
        let (best_metric, next_hop_nodes) =
            self.get_next_hops_with_metric(&selection.all_node_areas, link_state);

        if next_hop_nodes.is_empty() {
            debug!(%prefix, area, "no spf route to prefix in area");
            self.metrics.increment(METRIC_NO_ROUTE_TO_PREFIX, 1);
            return SpfAreaResults { best_metric, next_hops: BTreeSet::new() };
        }

        let next_hops = self.get_next_hops(
            &selection.all_node_areas,
            prefix.is_v4(),
            best_metric,
            &next_hop_nodes,
            None,
            area,
            link_state,
        );
        SpfAreaResults { best_metric, next_hops }
    }

    /// Returns the minimum metric to any selected originator plus, for
    /// each first-hop neighbor on a shortest path, the remaining distance
    /// from that neighbor to the destination set.
    fn get_next_hops_with_metric(
        &self,
        dst_node_areas: &BTreeSet<NodeAndArea>,
        link_state: &mut LinkState,
    ) -> (LinkStateMetric, BTreeMap<String, LinkStateMetric>) {
        let spf_result = link_state.get_spf_result(&self.my_node_name, true);

        let mut shortest_metric = LinkStateMetric::MAX;
        let mut min_cost_nodes: BTreeSet<&str> = BTreeSet::new();
        for (dst_node, _) in dst_node_areas {
            let Some(node) = spf_result.get(dst_node) else { continue };
            if shortest_metric >= node.metric {
                if shortest_metric > node.metric {
                    shortest_metric = node.metric;
                    min_cost_nodes.clear();
                }
                min_cost_nodes.insert(dst_node.as_str());
            }
        }

        let mut next_hop_nodes = BTreeMap::new();
        for dst_node in min_cost_nodes {
            for nh_name in &spf_result[dst_node].next_hops {
                let Some(to_nh) =
                    link_state.get_metric_from_a_to_b(&self.my_node_name, nh_name, true)
                else {
                    continue;
                };
                next_hop_nodes.insert(nh_name.clone(), shortest_metric - to_nh);
            }
        }
        (shortest_metric, next_hop_nodes)
    }

    /// Materializes next hops over the local links toward the given
    /// next-hop neighbors, keeping only links on globally shortest paths.
    #[allow(clippy::too_many_arguments)]
    fn get_next_hops(
        &self,
        dst_node_areas: &BTreeSet<NodeAndArea>,
        is_v4: bool,
        min_metric: LinkStateMetric,
        next_hop_nodes: &BTreeMap<String, LinkStateMetric>,
        swap_label: Option<i32>,
        area: &str,
        link_state: &LinkState,
    ) -> BTreeSet<NextHop> {
        let mut next_hops = BTreeSet::new();
        for link_id in link_state.links_from_node(&self.my_node_name) {
            let link = link_state.link(link_id);
            let neighbor = link.other_node(&self.my_node_name).to_string();
            let Some(nh_to_dst) = next_hop_nodes.get(&neighbor) else { continue };
            if !link.is_up() {
                continue;
            }

            // Ignore next hops that are not on a shortest path.
            let dist_over_link = link.metric_from_node(&self.my_node_name) + nh_to_dst;
            if dist_over_link != min_metric {
                continue;
            }

            let mpls_action = swap_label.map(|label| {
                let neighbor_is_dst =
                    dst_node_areas.contains(&(neighbor.clone(), area.to_string()));
                if neighbor_is_dst { MplsAction::Php } else { MplsAction::Swap(label) }
            });

            next_hops.insert(
                NextHop::builder()
                    .address(self.next_hop_address(link_state, link_id, is_v4))
                    .if_name(link.iface_from_node(&self.my_node_name))
                    .metric(dist_over_link)
                    .area(area)
                    .neighbor_node_name(neighbor)
                    .maybe_mpls_action(mpls_action)
                    .build(),
            );
        }
        next_hops
    }

    fn next_hop_address(&self, link_state: &LinkState, link_id: LinkId, is_v4: bool) -> IpAddr {
        let link = link_state.link(link_id);
        if is_v4 && !self.config.v4_over_v6_nexthop {
            IpAddr::V4(link.nh_v4_from_node(&self.my_node_name))
        } else {
            IpAddr::V6(link.nh_v6_from_node(&self.my_node_name))
        }
    }

    /// 1st and 2nd edge-disjoint shortest paths toward every selected
    /// originator, as label-stacked next hops. Requires SR-MPLS
    /// forwarding.
    fn select_best_paths_ksp2(
        &self,
        prefix: IpPrefix,
        selection: &RouteSelectionResult,
        forwarding_type: ForwardingType,
        area: &str,
        link_state: &mut LinkState,
    ) -> BTreeSet<NextHop> {
        let mut next_hops = BTreeSet::new();

        if forwarding_type != ForwardingType::SrMpls {
            error!(
                %prefix,
                ?forwarding_type,
                "incompatible forwarding type for KSP2_ED_ECMP"
            );
            self.metrics.increment(METRIC_INCOMPATIBLE_FORWARDING_TYPE, 1);
            return next_hops;
        }

        let mut paths: Vec<crate::link_state::Path> = Vec::new();
        for (node, best_area) in &selection.all_node_areas {
            if node == &self.my_node_name && best_area == area {
                continue;
            }
            for path in link_state.get_kth_paths(&self.my_node_name, node, 1).iter() {
                paths.push(path.clone());
            }
        }

        // Second shortest paths must not contain a first path, or anycast
        // destinations would double-spray traffic over the shared stem.
        let first_paths_count = paths.len();
        for (node, best_area) in &selection.all_node_areas {
            if best_area != area {
                continue;
            }
            for sec_path in link_state.get_kth_paths(&self.my_node_name, node, 2).iter() {
                let contains_first = paths[..first_paths_count]
                    .iter()
                    .any(|first| LinkState::path_a_in_path_b(first, sec_path));
                if !contains_first {
                    paths.push(sec_path.clone());
                }
            }
        }

        for path in &paths {
            let mut cost = 0;
            let mut labels = std::collections::VecDeque::new();
            let mut invalid_nodes: Vec<String> = Vec::new();
            let mut next_node = self.my_node_name.clone();
            for link_id in path {
                let link = link_state.link(*link_id);
                cost += link.metric_from_node(&next_node);
                next_node = link.other_node(&next_node).to_string();
                let Some(adj_db) = link_state.adjacency_databases().get(&next_node) else {
                    invalid_nodes.push(next_node.clone());
                    continue;
                };
                labels.push_front(adj_db.node_label);
                if !is_mpls_label_valid(adj_db.node_label) {
                    invalid_nodes.push(next_node.clone());
                }
            }
            if !invalid_nodes.is_empty() {
                warn!(%prefix, nodes = ?invalid_nodes, "ignoring path with invalid node labels");
                continue;
            }
            // The first hop's own label is penultimate-hop-popped.
            labels.pop_back();

            let Some(first_link_id) = path.first() else { continue };
            let first_link = link_state.link(*first_link_id);
            let mpls_action = (!labels.is_empty())
                .then(|| MplsAction::Push(labels.iter().copied().collect()));

            next_hops.insert(
                NextHop::builder()
                    .address(self.next_hop_address(link_state, *first_link_id, prefix.is_v4()))
                    .if_name(first_link.iface_from_node(&self.my_node_name))
                    .metric(cost)
                    .area(area)
                    .neighbor_node_name(first_link.other_node(&self.my_node_name))
                    .maybe_mpls_action(mpls_action)
                    .build(),
            );
        }
        next_hops
    }

    /// Applies the min-nexthop threshold and materializes the RIB entry.
    fn add_best_paths(
        &self,
        prefix: IpPrefix,
        selection: &RouteSelectionResult,
        prefix_entries: &PrefixEntries,
        next_hops: BTreeSet<NextHop>,
        shortest_metric: LinkStateMetric,
    ) -> Option<RibUnicastEntry> {
        if next_hops.is_empty() {
            return None;
        }

        // The strictest min-nexthop requirement across the selected
        // advertisements gates programming.
        let min_next_hop = selection
            .all_node_areas
            .iter()
            .filter_map(|node_area| prefix_entries.get(node_area))
            .filter_map(|entry| entry.min_nexthop)
            .max();
        if let Some(required) = min_next_hop {
            if (next_hops.len() as u64) < required {
                warn!(
                    %prefix,
                    required,
                    got = next_hops.len(),
                    "dropping route below min-nexthop requirement"
                );
                return None;
            }
        }

        let mut best_entry = prefix_entries.get(&selection.best_node_area)?.clone();
        if selection.is_best_node_drained {
            // Carry the drain signal when this entry is re-advertised
            // across areas.
            best_entry.metrics.drain_metric = 1;
        }

        Some(RibUnicastEntry {
            prefix,
            nexthops: next_hops,
            best_prefix_entry: best_entry,
            best_area: selection.best_node_area.1.clone(),
            shortest_metric,
            is_best_node_drained: selection.is_best_node_drained,
        })
    }

    /// MPLS routes for every node's segment label: POP_AND_LOOKUP for our
    /// own label, PHP toward direct destinations, SWAP through transit.
    fn node_segment_label_routes(
        &self,
        areas: &mut BTreeMap<String, LinkState>,
    ) -> Vec<RibMplsEntry> {
        let mut label_to_node: BTreeMap<i32, (String, RibMplsEntry)> = BTreeMap::new();

        let area_names: Vec<String> = areas.keys().cloned().collect();
        for area in area_names {
            let Some(link_state) = areas.get_mut(&area) else { continue };
            let labels: Vec<(String, i32)> = link_state
                .adjacency_databases()
                .iter()
                .map(|(node, db)| (node.clone(), db.node_label))
                .collect();

            for (node_name, label) in labels {
                if label == 0 {
                    // Unset label: non-SR node.
                    self.metrics.increment(METRIC_SKIPPED_MPLS_ROUTE, 1);
                    continue;
                }
                if !is_mpls_label_valid(label) {
                    error!(label, node = %node_name, area = %area, "ignoring invalid node label");
                    self.metrics.increment(METRIC_SKIPPED_MPLS_ROUTE, 1);
                    continue;
                }

                // Label collisions can happen transiently when segmented
                // networks join; the higher node name wins.
                if let Some((existing_node, _)) = label_to_node.get(&label) {
                    info!(label, existing = %existing_node, node = %node_name, "duplicate node label");
                    self.metrics.increment(METRIC_DUPLICATE_NODE_LABEL, 1);
                    if existing_node > &node_name {
                        continue;
                    }
                }

                if node_name == self.my_node_name {
                    let next_hop = NextHop::builder()
                        .address(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
                        .if_name("")
                        .area(&area)
                        .mpls_action(MplsAction::PopAndLookup)
                        .build();
                    label_to_node.insert(
                        label,
                        (node_name.clone(), RibMplsEntry::new(label, [next_hop])),
                    );
                    continue;
                }

                let dst: BTreeSet<NodeAndArea> =
                    BTreeSet::from([(node_name.clone(), area.clone())]);
                let (best_metric, next_hop_nodes) =
                    self.get_next_hops_with_metric(&dst, link_state);
                if next_hop_nodes.is_empty() {
                    warn!(label, node = %node_name, "no route to node label");
                    self.metrics.increment(METRIC_NO_ROUTE_TO_LABEL, 1);
                    continue;
                }
                let next_hops = self.get_next_hops(
                    &dst,
                    false,
                    best_metric,
                    &next_hop_nodes,
                    Some(label),
                    &area,
                    link_state,
                );
                label_to_node
                    .insert(label, (node_name, RibMplsEntry::new(label, next_hops)));
            }
        }

        label_to_node.into_values().map(|(_, entry)| entry).collect()
    }

    /// MPLS routes for our own adjacency labels: PHP straight over the
    /// advertising link.
    fn adjacency_label_routes(&self, areas: &BTreeMap<String, LinkState>) -> Vec<RibMplsEntry> {
        let mut entries = Vec::new();
        for link_state in areas.values() {
            for link_id in link_state.links_from_node(&self.my_node_name) {
                let link = link_state.link(link_id);
                let label = link.adj_label_from_node(&self.my_node_name);
                if label == 0 {
                    continue;
                }
                if !is_mpls_label_valid(label) {
                    error!(label, link = %link, "ignoring invalid adjacency label");
                    self.metrics.increment(METRIC_SKIPPED_MPLS_ROUTE, 1);
                    continue;
                }
                entries.push(RibMplsEntry::new(
                    label,
                    [NextHop::builder()
                        .address(IpAddr::V6(link.nh_v6_from_node(&self.my_node_name)))
                        .if_name(link.iface_from_node(&self.my_node_name))
                        .metric(link.metric_from_node(&self.my_node_name))
                        .area(link.area())
                        .neighbor_node_name(link.other_node(&self.my_node_name))
                        .mpls_action(MplsAction::Php)
                        .build()],
                ));
            }
        }
        entries
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use crate::test_support::{link_state_from_topology, link_state_with_labels};
    use trellis_types::{NoopMetrics, PrefixDatabase};

    use super::*;

    fn solver(me: &str) -> SpfSolver {
        solver_with_config(me, DecisionConfig::builder().build())
    }

    fn solver_with_config(me: &str, config: DecisionConfig) -> SpfSolver {
        SpfSolver::new(me, config, Arc::new(NoopMetrics))
    }

    fn prefix(s: &str) -> IpPrefix {
        s.parse().unwrap()
    }

    fn advertise(
        state: &mut PrefixState,
        node: &str,
        area: &str,
        entries: Vec<PrefixEntry>,
    ) {
        state.update_prefix_database(
            PrefixDatabase::builder()
                .this_node_name(node)
                .area(area)
                .prefix_entries(entries)
                .build(),
        );
    }

    fn v6_entry(p: &str) -> PrefixEntry {
        PrefixEntry::builder().prefix(prefix(p)).build()
    }

    fn linear_areas() -> BTreeMap<String, LinkState> {
        // 1 - 2 - 3 with unit metrics in area0.
        BTreeMap::from([(
            "area0".to_string(),
            link_state_from_topology(&[
                (1, &[(2, 1)]),
                (2, &[(1, 1), (3, 1)]),
                (3, &[(2, 1)]),
            ]),
        )])
    }

    #[test]
    fn test_simple_route_to_remote_prefix() {
        let mut areas = linear_areas();
        let mut prefixes = PrefixState::new();
        advertise(&mut prefixes, "3", "area0", vec![v6_entry("fc00::3/128")]);

        let mut solver = solver("1");
        let route_db = solver.build_route_db(&mut areas, &prefixes).unwrap();
        let entry = &route_db.unicast_routes[&prefix("fc00::3/128")];

        assert_eq!(entry.shortest_metric, 2);
        assert_eq!(entry.best_area, "area0");
        assert_eq!(entry.nexthops.len(), 1);
        let nh = entry.nexthops.iter().next().unwrap();
        assert_eq!(nh.neighbor_node_name, "2");
        assert_eq!(nh.metric, 2);
    }

    #[test]
    fn test_skip_self_advertised_prefix() {
        let mut areas = linear_areas();
        let mut prefixes = PrefixState::new();
        // Anycast prefix advertised by us and node 3.
        advertise(&mut prefixes, "1", "area0", vec![v6_entry("fc00::100/128")]);
        advertise(&mut prefixes, "3", "area0", vec![v6_entry("fc00::100/128")]);

        let mut solver = solver("1");
        let route_db = solver.build_route_db(&mut areas, &prefixes).unwrap();
        assert!(route_db.unicast_routes.is_empty());
    }

    #[test]
    fn test_unreachable_advertiser_filtered() {
        let mut areas = linear_areas();
        let mut prefixes = PrefixState::new();
        advertise(&mut prefixes, "9", "area0", vec![v6_entry("fc00::9/128")]);

        let mut solver = solver("1");
        let route_db = solver.build_route_db(&mut areas, &prefixes).unwrap();
        assert!(route_db.unicast_routes.is_empty());
    }

    #[test]
    fn test_v4_gate() {
        let mut areas = linear_areas();
        let mut prefixes = PrefixState::new();
        advertise(&mut prefixes, "3", "area0", vec![v6_entry("10.0.0.0/24")]);

        let config = DecisionConfig::builder().enable_v4(false).build();
        let mut solver = solver_with_config("1", config);
        let route_db = solver.build_route_db(&mut areas, &prefixes).unwrap();
        assert!(route_db.unicast_routes.is_empty());

        // v4-over-v6 re-enables it with a v6 next hop.
        let config =
            DecisionConfig::builder().enable_v4(false).v4_over_v6_nexthop(true).build();
        let mut solver = solver_with_config("1", config);
        let route_db = solver.build_route_db(&mut areas, &prefixes).unwrap();
        let entry = &route_db.unicast_routes[&prefix("10.0.0.0/24")];
        assert!(entry.nexthops.iter().next().unwrap().address.is_ipv6());
    }

    #[test]
    fn test_hard_drained_node_loses() {
        // Diamond: both 2 and 3 advertise; 2 is overloaded.
        let mut areas = BTreeMap::from([(
            "area0".to_string(),
            link_state_from_topology(&[
                (1, &[(2, 1), (3, 1)]),
                (2, &[(1, 1)]),
                (3, &[(1, 1)]),
            ]),
        )]);
        let ls = areas.get_mut("area0").unwrap();
        let mut db = ls.adjacency_databases()["2"].clone();
        db.is_overloaded = true;
        ls.update_adjacency_database(db);

        let mut prefixes = PrefixState::new();
        advertise(&mut prefixes, "2", "area0", vec![v6_entry("fc00::100/128")]);
        advertise(&mut prefixes, "3", "area0", vec![v6_entry("fc00::100/128")]);

        let mut solver = solver("1");
        let route_db = solver.build_route_db(&mut areas, &prefixes).unwrap();
        let entry = &route_db.unicast_routes[&prefix("fc00::100/128")];
        assert_eq!(entry.nexthops.iter().next().unwrap().neighbor_node_name, "3");
        assert!(!entry.is_best_node_drained);
    }

    #[test]
    fn test_all_drained_nodes_still_route_with_drain_signal() {
        let mut areas = BTreeMap::from([(
            "area0".to_string(),
            link_state_from_topology(&[(1, &[(2, 1)]), (2, &[(1, 1)])]),
        )]);
        let ls = areas.get_mut("area0").unwrap();
        let mut db = ls.adjacency_databases()["2"].clone();
        db.is_overloaded = true;
        ls.update_adjacency_database(db);

        let mut prefixes = PrefixState::new();
        advertise(&mut prefixes, "2", "area0", vec![v6_entry("fc00::2/128")]);

        let mut solver = solver("1");
        let route_db = solver.build_route_db(&mut areas, &prefixes).unwrap();
        let entry = &route_db.unicast_routes[&prefix("fc00::2/128")];
        assert!(entry.is_best_node_drained);
        assert_eq!(entry.best_prefix_entry.metrics.drain_metric, 1);
    }

    #[test]
    fn test_soft_drain_prefers_lowest_increment() {
        let mut areas = BTreeMap::from([(
            "area0".to_string(),
            link_state_from_topology(&[
                (1, &[(2, 1), (3, 1)]),
                (2, &[(1, 1)]),
                (3, &[(1, 1)]),
            ]),
        )]);
        let ls = areas.get_mut("area0").unwrap();
        let mut db = ls.adjacency_databases()["2"].clone();
        db.node_metric_increment_val = 50;
        ls.update_adjacency_database(db);

        let mut prefixes = PrefixState::new();
        advertise(&mut prefixes, "2", "area0", vec![v6_entry("fc00::100/128")]);
        advertise(&mut prefixes, "3", "area0", vec![v6_entry("fc00::100/128")]);

        let mut solver = solver("1");
        let route_db = solver.build_route_db(&mut areas, &prefixes).unwrap();
        let entry = &route_db.unicast_routes[&prefix("fc00::100/128")];
        assert_eq!(entry.nexthops.len(), 1);
        assert_eq!(entry.nexthops.iter().next().unwrap().neighbor_node_name, "3");
    }

    #[test]
    fn test_min_nexthop_threshold_drops_route() {
        let mut areas = linear_areas();
        let mut prefixes = PrefixState::new();
        let entry = PrefixEntry::builder()
            .prefix(prefix("fc00::3/128"))
            .min_nexthop(2)
            .build();
        advertise(&mut prefixes, "3", "area0", vec![entry]);

        let mut solver = solver("1");
        let route_db = solver.build_route_db(&mut areas, &prefixes).unwrap();
        // Only one next hop exists; requirement of two drops the route.
        assert!(route_db.unicast_routes.is_empty());
    }

    #[test]
    fn test_ecmp_merges_equal_cost_next_hops() {
        let mut areas = BTreeMap::from([(
            "area0".to_string(),
            link_state_from_topology(&[
                (1, &[(2, 1), (3, 1)]),
                (2, &[(1, 1), (4, 1)]),
                (3, &[(1, 1), (4, 1)]),
                (4, &[(2, 1), (3, 1)]),
            ]),
        )]);
        let mut prefixes = PrefixState::new();
        advertise(&mut prefixes, "4", "area0", vec![v6_entry("fc00::4/128")]);

        let mut solver = solver("1");
        let route_db = solver.build_route_db(&mut areas, &prefixes).unwrap();
        let entry = &route_db.unicast_routes[&prefix("fc00::4/128")];
        let neighbors: BTreeSet<&str> =
            entry.nexthops.iter().map(|nh| nh.neighbor_node_name.as_str()).collect();
        assert_eq!(neighbors, BTreeSet::from(["2", "3"]));
        assert_eq!(entry.shortest_metric, 2);
    }

    #[test]
    fn test_ksp2_requires_sr_mpls() {
        let mut areas = BTreeMap::from([(
            "area0".to_string(),
            link_state_with_labels(
                &[(1, &[(2, 1)]), (2, &[(1, 1)])],
                &[(1, 65001), (2, 65002)],
            ),
        )]);
        let mut prefixes = PrefixState::new();
        let entry = PrefixEntry::builder()
            .prefix(prefix("fc00::2/128"))
            .forwarding_algorithm(ForwardingAlgorithm::Ksp2EdEcmp)
            .build();
        advertise(&mut prefixes, "2", "area0", vec![entry]);

        let mut solver = solver("1");
        let route_db = solver.build_route_db(&mut areas, &prefixes).unwrap();
        assert!(route_db.unicast_routes.is_empty());
    }

    #[test]
    fn test_ksp2_builds_label_stacks() {
        // Diamond: 1-2-4 and 1-3-4, KSP2 toward 4.
        let mut areas = BTreeMap::from([(
            "area0".to_string(),
            link_state_with_labels(
                &[
                    (1, &[(2, 10), (3, 5)]),
                    (2, &[(1, 10), (4, 15)]),
                    (3, &[(1, 5), (4, 20)]),
                    (4, &[(2, 15), (3, 20)]),
                ],
                &[(1, 65001), (2, 65002), (3, 65003), (4, 65004)],
            ),
        )]);
        let mut prefixes = PrefixState::new();
        let entry = PrefixEntry::builder()
            .prefix(prefix("fc00::4/128"))
            .forwarding_type(ForwardingType::SrMpls)
            .forwarding_algorithm(ForwardingAlgorithm::Ksp2EdEcmp)
            .build();
        advertise(&mut prefixes, "4", "area0", vec![entry]);

        let mut solver = solver("1");
        let route_db = solver.build_route_db(&mut areas, &prefixes).unwrap();
        let entry = &route_db.unicast_routes[&prefix("fc00::4/128")];

        // Two edge-disjoint paths: via 3 (metric 25) and via 2 (25).
        assert_eq!(entry.nexthops.len(), 2);
        for nh in &entry.nexthops {
            assert_eq!(nh.metric, 25);
            // Two-hop paths push the far node's label; the first hop is
            // PHP'd away.
            assert_eq!(nh.mpls_action, Some(MplsAction::Push(vec![65004])));
        }
        let neighbors: BTreeSet<&str> =
            entry.nexthops.iter().map(|nh| nh.neighbor_node_name.as_str()).collect();
        assert_eq!(neighbors, BTreeSet::from(["2", "3"]));
    }

    #[test]
    fn test_node_segment_label_routes() {
        let mut areas = BTreeMap::from([(
            "area0".to_string(),
            link_state_with_labels(
                &[
                    (1, &[(2, 1)]),
                    (2, &[(1, 1), (3, 1)]),
                    (3, &[(2, 1)]),
                ],
                &[(1, 65001), (2, 65002), (3, 65003)],
            ),
        )]);
        let prefixes = PrefixState::new();

        let config = DecisionConfig::builder().enable_node_segment_label(true).build();
        let mut solver = solver_with_config("1", config);
        let route_db = solver.build_route_db(&mut areas, &prefixes).unwrap();

        // Our own label: POP_AND_LOOKUP.
        let own = &route_db.mpls_routes[&65001];
        assert_eq!(
            own.nexthops.iter().next().unwrap().mpls_action,
            Some(MplsAction::PopAndLookup)
        );

        // Direct neighbor: PHP.
        let neighbor = &route_db.mpls_routes[&65002];
        assert_eq!(neighbor.nexthops.iter().next().unwrap().mpls_action, Some(MplsAction::Php));

        // Two hops away: SWAP through node 2.
        let remote = &route_db.mpls_routes[&65003];
        let nh = remote.nexthops.iter().next().unwrap();
        assert_eq!(nh.mpls_action, Some(MplsAction::Swap(65003)));
        assert_eq!(nh.neighbor_node_name, "2");
    }

    #[test]
    fn test_duplicate_node_label_higher_name_wins() {
        let mut areas = BTreeMap::from([(
            "area0".to_string(),
            link_state_with_labels(
                &[
                    (1, &[(2, 1), (3, 1)]),
                    (2, &[(1, 1)]),
                    (3, &[(1, 1)]),
                ],
                // Nodes 2 and 3 collide on the same label.
                &[(1, 65001), (2, 65999), (3, 65999)],
            ),
        )]);
        let prefixes = PrefixState::new();

        let config = DecisionConfig::builder().enable_node_segment_label(true).build();
        let mut solver = solver_with_config("1", config);
        let route_db = solver.build_route_db(&mut areas, &prefixes).unwrap();

        let colliding = &route_db.mpls_routes[&65999];
        assert_eq!(colliding.nexthops.iter().next().unwrap().neighbor_node_name, "3");
    }

    #[test]
    fn test_adjacency_label_routes() {
        let mut areas = BTreeMap::from([(
            "area0".to_string(),
            link_state_with_labels(&[(1, &[(2, 1)]), (2, &[(1, 1)])], &[(1, 0), (2, 0)]),
        )]);
        // Give node 1's adjacency a label.
        {
            let ls = areas.get_mut("area0").unwrap();
            let mut db = ls.adjacency_databases()["1"].clone();
            db.adjacencies[0].adj_label = 70001;
            ls.update_adjacency_database(db);
        }
        let prefixes = PrefixState::new();

        let config = DecisionConfig::builder().enable_adjacency_labels(true).build();
        let mut solver = solver_with_config("1", config);
        let route_db = solver.build_route_db(&mut areas, &prefixes).unwrap();

        let entry = &route_db.mpls_routes[&70001];
        let nh = entry.nexthops.iter().next().unwrap();
        assert_eq!(nh.mpls_action, Some(MplsAction::Php));
        assert_eq!(nh.neighbor_node_name, "2");
    }

    #[test]
    fn test_static_routes_have_lower_priority() {
        let mut areas = linear_areas();
        let mut prefixes = PrefixState::new();
        advertise(&mut prefixes, "3", "area0", vec![v6_entry("fc00::3/128")]);

        let mut solver = solver("1");
        let static_entry = RibUnicastEntry {
            prefix: prefix("fc00::3/128"),
            nexthops: BTreeSet::from([NextHop::builder()
                .address("fe80::99".parse::<std::net::IpAddr>().unwrap())
                .if_name("static0")
                .build()]),
            best_prefix_entry: v6_entry("fc00::3/128"),
            best_area: String::new(),
            shortest_metric: 0,
            is_best_node_drained: false,
        };
        let static_only = RibUnicastEntry {
            prefix: prefix("fc00::99/128"),
            ..static_entry.clone()
        };
        solver.update_static_unicast_routes(
            BTreeMap::from([
                (prefix("fc00::3/128"), static_entry),
                (prefix("fc00::99/128"), static_only),
            ]),
            Vec::new(),
        );

        let route_db = solver.build_route_db(&mut areas, &prefixes).unwrap();
        // Computed route wins for fc00::3; static fills in fc00::99.
        let computed = &route_db.unicast_routes[&prefix("fc00::3/128")];
        assert_eq!(computed.nexthops.iter().next().unwrap().neighbor_node_name, "2");
        let statics = &route_db.unicast_routes[&prefix("fc00::99/128")];
        assert_eq!(statics.nexthops.iter().next().unwrap().if_name, "static0");
    }

    #[test]
    fn test_no_route_db_until_local_node_known() {
        let mut areas = BTreeMap::from([(
            "area0".to_string(),
            link_state_from_topology(&[(2, &[(3, 1)]), (3, &[(2, 1)])]),
        )]);
        let prefixes = PrefixState::new();
        let mut solver = solver("1");
        assert!(solver.build_route_db(&mut areas, &prefixes).is_none());
    }
}
