//! Per-area link-state graph.
//!
//! Holds every node's adjacency database, materializes bidirectional
//! links, and answers path queries: shortest paths (Dijkstra with
//! equal-cost multipath), k-shortest edge-disjoint paths, and UCMP weight
//! resolution. SPF and k-path results are memoized and invalidated on any
//! topology change.
//!
//! The graph is undirected for reachability but per-direction for metric;
//! links may have asymmetric costs.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use trellis_types::{Adjacency, AdjacencyDatabase, ForwardingAlgorithm};

use crate::link::{HoldableValue, Link, LinkId, LinkKey, LinkStateMetric};

/// Shortest-path facts for one destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpfNode {
    /// Distance from the SPF source.
    pub metric: LinkStateMetric,
    /// Neighbors of the source that start a shortest path here.
    pub next_hops: BTreeSet<String>,
    /// Incoming shortest-path edges, for path tracing and UCMP.
    pub path_links: Vec<PathLink>,
}

impl SpfNode {
    fn new(metric: LinkStateMetric) -> Self {
        Self { metric, ..Default::default() }
    }
}

/// One incoming shortest-path edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLink {
    /// The edge itself.
    pub link: LinkId,
    /// The upstream node (closer to the SPF source).
    pub prev_node: String,
}

/// SPF output: destination node to its shortest-path facts.
pub type SpfResult = BTreeMap<String, SpfNode>;

/// An ordered walk of links from source to destination.
pub type Path = Vec<LinkId>;

/// UCMP weight resolution output per node.
pub type UcmpResult = BTreeMap<String, UcmpNode>;

/// Resolved UCMP state of one node.
#[derive(Debug, Clone, Default)]
pub struct UcmpNode {
    /// The weight this node advertises upstream.
    pub weight: Option<i64>,
    /// Downstream next-hop links with their resolved weights.
    pub next_hop_links: Vec<UcmpNextHop>,
}

/// One weighted next hop in a UCMP resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UcmpNextHop {
    /// Outgoing interface at this node.
    pub if_name: String,
    /// The link taken.
    pub link: LinkId,
    /// The downstream node reached.
    pub next_node: String,
    /// Resolved weight of this next hop.
    pub weight: i64,
}

/// What changed after an adjacency database update.
#[derive(Debug, Default)]
pub struct LinkStateChange {
    /// Reachability or cost changed; SPF caches were invalidated.
    pub topology_changed: bool,
    /// The node's segment label changed.
    pub node_label_changed: bool,
    /// Link attributes that do not affect SPF (labels, weights, next-hop
    /// addresses) changed.
    pub link_attributes_changed: bool,
    /// Links that came up.
    pub added_links: Vec<LinkId>,
    /// Links that went away.
    pub removed_links: Vec<LinkId>,
}

/// Per-area link-state database.
pub struct LinkState {
    area: String,
    next_link_id: u64,
    links: HashMap<LinkId, Link>,
    key_to_id: BTreeMap<LinkKey, LinkId>,
    link_map: HashMap<String, BTreeSet<LinkId>>,
    adjacency_databases: BTreeMap<String, AdjacencyDatabase>,
    node_overloads: HashMap<String, HoldableValue<bool>>,
    node_metric_increments: HashMap<String, u64>,
    spf_results: HashMap<(String, bool), Arc<SpfResult>>,
    kth_path_results: HashMap<(String, String, usize), Arc<Vec<Path>>>,
}

impl LinkState {
    /// Creates an empty graph for `area`.
    pub fn new(area: impl Into<String>) -> Self {
        Self {
            area: area.into(),
            next_link_id: 0,
            links: HashMap::new(),
            key_to_id: BTreeMap::new(),
            link_map: HashMap::new(),
            adjacency_databases: BTreeMap::new(),
            node_overloads: HashMap::new(),
            node_metric_increments: HashMap::new(),
            spf_results: HashMap::new(),
            kth_path_results: HashMap::new(),
        }
    }

    /// Area this graph belongs to.
    pub fn area(&self) -> &str {
        &self.area
    }

    /// True when `node` has advertised an adjacency database.
    pub fn has_node(&self, node: &str) -> bool {
        self.adjacency_databases.contains_key(node)
    }

    /// All advertised adjacency databases.
    pub fn adjacency_databases(&self) -> &BTreeMap<String, AdjacencyDatabase> {
        &self.adjacency_databases
    }

    /// Resolves a link id.
    ///
    /// A dangling id means the link maps are corrupted, which is fatal.
    pub fn link(&self, id: LinkId) -> &Link {
        match self.links.get(&id) {
            Some(link) => link,
            None => panic!("link map corruption: dangling link id {id:?} in area {}", self.area),
        }
    }

    /// Ids of every link incident to `node`.
    pub fn links_from_node(&self, node: &str) -> Vec<LinkId> {
        self.link_map.get(node).map(|set| set.iter().copied().collect()).unwrap_or_default()
    }

    /// Links incident to `node`, ordered by identity key.
    fn ordered_links_from_node(&self, node: &str) -> Vec<(LinkKey, LinkId)> {
        let mut links: Vec<(LinkKey, LinkId)> = self
            .links_from_node(node)
            .into_iter()
            .map(|id| (self.link(id).key(), id))
            .collect();
        links.sort();
        links
    }

    /// True when `node` is hard-drained (overloaded).
    pub fn is_node_overloaded(&self, node: &str) -> bool {
        self.node_overloads.get(node).is_some_and(|hv| hv.value())
    }

    /// The node's soft-drain metric increment (0 when not advertised).
    pub fn get_node_metric_increment(&self, node: &str) -> u64 {
        self.node_metric_increments.get(node).copied().unwrap_or(0)
    }

    fn update_node_overloaded(
        &mut self,
        node: &str,
        is_overloaded: bool,
        hold_up_ttl: LinkStateMetric,
        hold_down_ttl: LinkStateMetric,
    ) -> bool {
        if let Some(hv) = self.node_overloads.get_mut(node) {
            return hv.update_value(is_overloaded, hold_up_ttl, hold_down_ttl);
        }
        self.node_overloads.insert(node.to_string(), HoldableValue::new(is_overloaded));
        // A node seen for the first time is not a topology change by
        // itself; its links will report.
        false
    }

    fn add_link(&mut self, link: Link) -> LinkId {
        let key = link.key();
        let id = LinkId(self.next_link_id);
        self.next_link_id += 1;
        let (first, second) = (key.0.0.clone(), key.1.0.clone());
        if self.key_to_id.insert(key, id).is_some() {
            panic!("duplicate link insertion in area {}: {link}", self.area);
        }
        assert!(self.link_map.entry(first).or_default().insert(id));
        assert!(self.link_map.entry(second).or_default().insert(id));
        self.links.insert(id, link);
        id
    }

    fn remove_link(&mut self, id: LinkId) {
        let link = match self.links.remove(&id) {
            Some(link) => link,
            None => panic!("link map corruption: removing unknown link {id:?}"),
        };
        let key = link.key();
        assert!(self.key_to_id.remove(&key).is_some());
        for node in [&key.0.0, &key.1.0] {
            let set = self.link_map.get_mut(node.as_str());
            assert!(set.is_some_and(|s| s.remove(&id)), "link map corruption for {node}");
        }
    }

    fn remove_node(&mut self, node: &str) {
        for (_, id) in self.ordered_links_from_node(node) {
            self.remove_link(id);
        }
        self.link_map.remove(node);
        self.node_overloads.remove(node);
    }

    /// Builds a link for `adj` only if the far end already advertises the
    /// symmetric adjacency on the matching interface pair.
    fn maybe_make_link(&self, node_name: &str, adj: &Adjacency) -> Option<Link> {
        let other_db = self.adjacency_databases.get(&adj.other_node_name)?;
        for other_adj in &other_db.adjacencies {
            if other_adj.other_node_name == node_name
                && adj.other_if_name == other_adj.if_name
                && adj.if_name == other_adj.other_if_name
            {
                return Some(Link::new(
                    &self.area,
                    node_name,
                    adj,
                    &adj.other_node_name,
                    other_adj,
                ));
            }
        }
        None
    }

    fn ordered_candidate_links(&self, adj_db: &AdjacencyDatabase) -> Vec<(LinkKey, Link)> {
        let mut links: Vec<(LinkKey, Link)> = adj_db
            .adjacencies
            .iter()
            .filter_map(|adj| self.maybe_make_link(&adj_db.this_node_name, adj))
            .map(|link| (link.key(), link))
            .collect();
        links.sort_by(|a, b| a.0.cmp(&b.0));
        links
    }

    /// Applies a node's new adjacency database, materializing and removing
    /// links and updating per-direction attributes in place.
    pub fn update_adjacency_database(&mut self, new_db: AdjacencyDatabase) -> LinkStateChange {
        // Hold TTLs are dormant; links always change immediately.
        let (hold_up_ttl, hold_down_ttl) = (0, 0);
        let node_name = new_db.this_node_name.clone();
        for adj in &new_db.adjacencies {
            debug!(
                area = %self.area,
                node = %node_name,
                neighbor = %adj.other_node_name,
                if_name = %adj.if_name,
                metric = adj.metric,
                overloaded = adj.is_overloaded,
                "adjacency"
            );
        }

        let mut change = LinkStateChange::default();
        let prior_db =
            self.adjacency_databases.insert(node_name.clone(), new_db.clone()).unwrap_or_default();

        change.topology_changed |= self.update_node_overloaded(
            &node_name,
            new_db.is_overloaded,
            hold_up_ttl,
            hold_down_ttl,
        );
        change.topology_changed |=
            prior_db.node_metric_increment_val != new_db.node_metric_increment_val;
        self.node_metric_increments.insert(node_name.clone(), new_db.node_metric_increment_val);
        change.node_label_changed = prior_db.node_label != new_db.node_label;

        // Walk old and new links in identity-key order to discern added,
        // removed, and attribute-changed edges in one pass.
        let old_links = self.ordered_links_from_node(&node_name);
        let new_links = self.ordered_candidate_links(&new_db);
        let mut old_iter = old_links.into_iter().peekable();
        let mut new_iter = new_links.into_iter().peekable();

        loop {
            // None = same link on both sides; Some(true) = new-only link;
            // Some(false) = old-only link.
            let take_new = match (new_iter.peek(), old_iter.peek()) {
                (None, None) => break,
                (Some(_), None) => Some(true),
                (None, Some(_)) => Some(false),
                (Some((new_key, _)), Some((old_key, _))) => match new_key.cmp(old_key) {
                    std::cmp::Ordering::Less => Some(true),
                    std::cmp::Ordering::Greater => Some(false),
                    std::cmp::Ordering::Equal => None,
                },
            };
            match take_new {
                Some(true) => {
                    let Some((_, mut link)) = new_iter.next() else { break };
                    link.set_hold_up_ttl(hold_up_ttl);
                    change.topology_changed |= link.is_up();
                    info!(area = %self.area, link = %link, "link up");
                    let id = self.add_link(link);
                    change.added_links.push(id);
                }
                Some(false) => {
                    let Some((_, id)) = old_iter.next() else { break };
                    // A link that was overloaded away does not change the
                    // topology by disappearing.
                    change.topology_changed |= self.link(id).is_up();
                    info!(area = %self.area, link = %self.link(id), "link down");
                    self.remove_link(id);
                    change.removed_links.push(id);
                }
                None => {
                    let (Some((_, new_link)), Some((_, id))) = (new_iter.next(), old_iter.next())
                    else {
                        break;
                    };
                    change.topology_changed |= self.update_link_attributes(
                        &node_name,
                        id,
                        &new_link,
                        &mut change.link_attributes_changed,
                    );
                }
            }
        }

        if change.topology_changed {
            self.spf_results.clear();
            self.kth_path_results.clear();
        }
        change
    }

    fn update_link_attributes(
        &mut self,
        node: &str,
        id: LinkId,
        new_link: &Link,
        attributes_changed: &mut bool,
    ) -> bool {
        let mut topology_changed = false;
        let area = self.area.clone();
        let Some(old_link) = self.links.get_mut(&id) else {
            panic!("link map corruption: dangling link id {id:?}");
        };

        let new_metric = new_link.metric_from_node(node);
        if new_metric != old_link.metric_from_node(node) {
            info!(area = %area, link = %old_link, metric = new_metric, "link metric change");
            topology_changed |= old_link.set_metric_from_node(node, new_metric);
        }

        let new_overload = new_link.overload_from_node(node);
        if new_overload != old_link.overload_from_node(node) {
            info!(area = %area, link = %old_link, overloaded = new_overload, "link overload change");
            topology_changed |= old_link.set_overload_from_node(node, new_overload);
        }

        let new_adj_label = new_link.adj_label_from_node(node);
        if new_adj_label != old_link.adj_label_from_node(node) {
            *attributes_changed = true;
            old_link.set_adj_label_from_node(node, new_adj_label);
        }

        let new_weight = new_link.weight_from_node(node);
        if new_weight != old_link.weight_from_node(node) {
            *attributes_changed = true;
            old_link.set_weight_from_node(node, new_weight);
        }

        let new_nh_v4 = new_link.nh_v4_from_node(node);
        if new_nh_v4 != old_link.nh_v4_from_node(node) {
            *attributes_changed = true;
            old_link.set_nh_v4_from_node(node, new_nh_v4);
        }

        let new_nh_v6 = new_link.nh_v6_from_node(node);
        if new_nh_v6 != old_link.nh_v6_from_node(node) {
            *attributes_changed = true;
            old_link.set_nh_v6_from_node(node, new_nh_v6);
        }

        topology_changed
    }

    /// Removes a node's adjacency database and every link it anchors.
    pub fn delete_adjacency_database(&mut self, node: &str) -> LinkStateChange {
        let mut change = LinkStateChange::default();
        if self.adjacency_databases.remove(node).is_some() {
            info!(area = %self.area, node, "deleting adjacency database");
            self.remove_node(node);
            self.node_metric_increments.remove(node);
            self.spf_results.clear();
            self.kth_path_results.clear();
            change.topology_changed = true;
        } else {
            warn!(area = %self.area, node, "deleting adjacency database for unknown node");
        }
        change
    }

    /// Counts down all link and node holds.
    pub fn decrement_holds(&mut self) -> LinkStateChange {
        let mut change = LinkStateChange::default();
        for link in self.links.values_mut() {
            change.topology_changed |= link.decrement_holds();
        }
        for hv in self.node_overloads.values_mut() {
            change.topology_changed |= hv.decrement_ttl();
        }
        if change.topology_changed {
            self.spf_results.clear();
            self.kth_path_results.clear();
        }
        change
    }

    /// True while any hold is armed.
    pub fn has_holds(&self) -> bool {
        self.links.values().any(Link::has_holds)
            || self.node_overloads.values().any(HoldableValue::has_hold)
    }

    // ========================================================================
    // Path computations
    // ========================================================================

    /// Shortest-path distance from `a` to `b`.
    pub fn get_metric_from_a_to_b(
        &mut self,
        a: &str,
        b: &str,
        use_link_metric: bool,
    ) -> Option<LinkStateMetric> {
        if a == b {
            return Some(0);
        }
        self.get_spf_result(a, use_link_metric).get(b).map(|n| n.metric)
    }

    /// Memoized SPF from `source`.
    pub fn get_spf_result(&mut self, source: &str, use_link_metric: bool) -> Arc<SpfResult> {
        let key = (source.to_string(), use_link_metric);
        if let Some(cached) = self.spf_results.get(&key) {
            return Arc::clone(cached);
        }
        let result = Arc::new(self.run_spf(source, use_link_metric, &BTreeSet::new()));
        self.spf_results.insert(key, Arc::clone(&result));
        result
    }

    /// Dijkstra from `source`, recording equal-cost path sets.
    ///
    /// Overloaded nodes accept terminating traffic but offer no transit:
    /// their shortest paths are recorded, but their adjacencies are never
    /// relaxed (unless the node is the source itself). Links in
    /// `links_to_ignore` or not up are skipped.
    pub fn run_spf(
        &self,
        source: &str,
        use_link_metric: bool,
        links_to_ignore: &BTreeSet<LinkId>,
    ) -> SpfResult {
        let mut result = SpfResult::new();
        let mut tentative: HashMap<String, SpfNode> = HashMap::new();
        let mut heap: BinaryHeap<Reverse<(LinkStateMetric, String)>> = BinaryHeap::new();

        tentative.insert(source.to_string(), SpfNode::new(0));
        heap.push(Reverse((0, source.to_string())));

        while let Some(Reverse((metric, node))) = heap.pop() {
            if result.contains_key(&node) {
                // Stale heap entry for an already-settled node.
                continue;
            }
            let Some(settled) = tentative.remove(&node) else { continue };
            let next_hops = settled.next_hops.clone();
            result.insert(node.clone(), settled);

            if self.is_node_overloaded(&node) && node != source {
                continue;
            }

            for link_id in self.links_from_node(&node) {
                let link = self.link(link_id);
                let other = link.other_node(&node).to_string();
                if !link.is_up() || result.contains_key(&other) || links_to_ignore.contains(&link_id)
                {
                    continue;
                }
                let cost = if use_link_metric { link.metric_from_node(&node) } else { 1 };
                let alt = metric + cost;
                let entry = tentative.entry(other.clone()).or_insert_with(|| {
                    heap.push(Reverse((alt, other.clone())));
                    SpfNode::new(alt)
                });
                if entry.metric >= alt {
                    if entry.metric > alt {
                        // Strictly better path: forget prior alternatives.
                        *entry = SpfNode::new(alt);
                        heap.push(Reverse((alt, other.clone())));
                    }
                    entry.path_links.push(PathLink { link: link_id, prev_node: node.clone() });
                    if next_hops.is_empty() {
                        // Directly connected to the source.
                        entry.next_hops.insert(other.clone());
                    } else {
                        entry.next_hops.extend(next_hops.iter().cloned());
                    }
                }
            }
        }
        result
    }

    /// Memoized k-th shortest path set between two nodes.
    ///
    /// For `k > 1`, all links used by the `< k`-th paths are removed from
    /// consideration and SPF re-runs, yielding edge-disjoint alternatives.
    pub fn get_kth_paths(&mut self, src: &str, dest: &str, k: usize) -> Arc<Vec<Path>> {
        assert!(k >= 1, "k-shortest-paths requires k >= 1");
        let key = (src.to_string(), dest.to_string(), k);
        if let Some(cached) = self.kth_path_results.get(&key) {
            return Arc::clone(cached);
        }

        let mut links_to_ignore = BTreeSet::new();
        for i in 1..k {
            for path in self.get_kth_paths(src, dest, i).iter() {
                links_to_ignore.extend(path.iter().copied());
            }
        }

        let result = if links_to_ignore.is_empty() {
            self.get_spf_result(src, true)
        } else {
            Arc::new(self.run_spf(src, true, &links_to_ignore))
        };

        let mut paths = Vec::new();
        if result.contains_key(dest) {
            let mut visited_links = BTreeSet::new();
            while let Some(path) = self.trace_one_path(src, dest, &result, &mut visited_links) {
                if path.is_empty() {
                    break;
                }
                paths.push(path);
            }
        }

        let paths = Arc::new(paths);
        self.kth_path_results.insert(key, Arc::clone(&paths));
        paths
    }

    /// Extracts one not-yet-traced path from an SPF result by walking
    /// `path_links` backward from the destination. Every link used is
    /// recorded in `visited_links`; repeated calls enumerate distinct
    /// paths until `None`.
    pub fn trace_one_path(
        &self,
        src: &str,
        dest: &str,
        result: &SpfResult,
        visited_links: &mut BTreeSet<LinkId>,
    ) -> Option<Path> {
        if src == dest {
            return Some(Path::new());
        }
        let node_result = result.get(dest)?;
        for path_link in &node_result.path_links {
            if visited_links.insert(path_link.link) {
                if let Some(mut path) =
                    self.trace_one_path(src, &path_link.prev_node, result, visited_links)
                {
                    path.push(path_link.link);
                    return Some(path);
                }
            }
        }
        None
    }

    /// True when every link of `path_a` also appears in `path_b`.
    pub fn path_a_in_path_b(path_a: &Path, path_b: &Path) -> bool {
        let b: BTreeSet<LinkId> = path_b.iter().copied().collect();
        path_a.iter().all(|link| b.contains(link))
    }

    /// Resolves UCMP weights by walking an SPF graph from the given leaf
    /// nodes back toward its root.
    ///
    /// All leaves must be equidistant from the root; otherwise the
    /// resolution is abandoned and an empty result returned. Non-leaf
    /// nodes advertise the sum of their next-hop link weights (AWP) or
    /// next-hop prefix weights (PWP); every node's next-hop weights are
    /// reduced by their GCD to keep hardware table widths small.
    pub fn resolve_ucmp_weights(
        &self,
        spf_graph: &SpfResult,
        leaf_node_weights: &BTreeMap<String, i64>,
        algo: ForwardingAlgorithm,
        use_link_metric: bool,
    ) -> UcmpResult {
        assert!(
            matches!(
                algo,
                ForwardingAlgorithm::SpUcmpAdjWeightPropagation
                    | ForwardingAlgorithm::SpUcmpPrefixWeightPropagation
            ),
            "resolve_ucmp_weights requires a UCMP algorithm"
        );

        struct BuildNode {
            node: UcmpNode,
        }

        let mut ucmp_result = UcmpResult::new();
        let mut tentative: HashMap<String, BuildNode> = HashMap::new();
        let mut heap: BinaryHeap<Reverse<(LinkStateMetric, String)>> = BinaryHeap::new();

        // Seed with the leaves, insisting they sit at one distance from
        // the root.
        let mut leaf_metric: Option<LinkStateMetric> = None;
        for (leaf, weight) in leaf_node_weights {
            let Some(dst) = spf_graph.get(leaf) else { continue };
            match leaf_metric {
                None => leaf_metric = Some(dst.metric),
                Some(expected) if expected != dst.metric => {
                    error!(
                        area = %self.area,
                        leaf = %leaf,
                        metric = dst.metric,
                        expected,
                        "skipping ucmp resolution: leaf nodes not equidistant from root"
                    );
                    return ucmp_result;
                }
                Some(_) => {}
            }
            tentative.insert(
                leaf.clone(),
                BuildNode { node: UcmpNode { weight: Some(*weight), next_hop_links: Vec::new() } },
            );
            heap.push(Reverse((0, leaf.clone())));
        }

        // Walk the SPF DAG from the leaves toward the root.
        while let Some(Reverse((metric, node))) = heap.pop() {
            if ucmp_result.contains_key(&node) {
                continue;
            }
            let Some(mut build) = tentative.remove(&node) else { continue };

            // Aggregate the advertised weight for non-leaf nodes.
            let advertised_weight = match build.node.weight {
                Some(weight) => weight,
                None => {
                    let advertised: i64 = build
                        .node
                        .next_hop_links
                        .iter()
                        .map(|nh| match algo {
                            ForwardingAlgorithm::SpUcmpAdjWeightPropagation => {
                                self.link(nh.link).weight_from_node(&node)
                            }
                            _ => nh.weight,
                        })
                        .sum();
                    build.node.weight = Some(advertised);
                    advertised
                }
            };

            let Some(spf_node) = spf_graph.get(&node) else {
                // Nodes in the walk come from the SPF graph by
                // construction.
                continue;
            };

            // Push this node's weight to its upstream neighbors.
            for path_link in &spf_node.path_links {
                let link = self.link(path_link.link);
                let link_metric =
                    if use_link_metric { link.metric_from_node(&path_link.prev_node) } else { 1 };
                let prev_metric = metric + link_metric;
                let prev = tentative.entry(path_link.prev_node.clone()).or_insert_with(|| {
                    heap.push(Reverse((prev_metric, path_link.prev_node.clone())));
                    BuildNode { node: UcmpNode::default() }
                });
                prev.node.next_hop_links.push(UcmpNextHop {
                    if_name: link.iface_from_node(&path_link.prev_node).to_string(),
                    link: path_link.link,
                    next_node: node.clone(),
                    weight: advertised_weight,
                });
            }

            Self::normalize_next_hop_weights(&mut build.node);
            ucmp_result.insert(node, build.node);
        }

        ucmp_result
    }

    /// Reduces a node's next-hop weights by their greatest common divisor.
    fn normalize_next_hop_weights(node: &mut UcmpNode) {
        let gcd = node
            .next_hop_links
            .iter()
            .map(|nh| nh.weight.unsigned_abs())
            .fold(0u64, Self::gcd);
        if gcd > 1 {
            for nh in &mut node.next_hop_links {
                nh.weight /= gcd as i64;
            }
        }
    }

    fn gcd(a: u64, b: u64) -> u64 {
        if b == 0 { a } else { Self::gcd(b, a % b) }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::test_support::{create_adj_db, create_adjacency, link_state_from_topology};
    use trellis_types::net::DEFAULT_ADJ_WEIGHT;

    use super::*;

    #[test]
    fn test_link_materializes_only_bidirectionally() {
        let mut state = LinkState::new("area0");
        let adj12 = create_adjacency("node2", "if2", "if1", 1);
        let adj21 = create_adjacency("node1", "if1", "if2", 1);

        let change = state.update_adjacency_database(create_adj_db("node1", vec![adj12], 1));
        assert!(!change.topology_changed);
        assert!(change.added_links.is_empty());

        let change = state.update_adjacency_database(create_adj_db("node2", vec![adj21], 2));
        assert!(change.topology_changed);
        assert_eq!(change.added_links.len(), 1);
        assert_eq!(state.links_from_node("node1").len(), 1);
        assert_eq!(state.links_from_node("node2").len(), 1);
    }

    #[test]
    fn test_basic_topology_updates() {
        let adj12 = create_adjacency("node2", "if2", "if1", 1);
        let adj13 = create_adjacency("node3", "if3", "if1", 1);
        let adj21 = create_adjacency("node1", "if1", "if2", 1);
        let adj23 = create_adjacency("node3", "if3", "if2", 1);
        let adj31 = create_adjacency("node1", "if1", "if3", 1);
        let adj32 = create_adjacency("node2", "if2", "if3", 1);

        let mut state = LinkState::new("area0");
        assert!(
            !state
                .update_adjacency_database(create_adj_db(
                    "node1",
                    vec![adj12.clone(), adj13.clone()],
                    1
                ))
                .topology_changed
        );
        let change = state
            .update_adjacency_database(create_adj_db("node2", vec![adj21.clone(), adj23.clone()], 2));
        assert!(change.topology_changed);
        assert_eq!(change.added_links.len(), 1);
        let change = state
            .update_adjacency_database(create_adj_db("node3", vec![adj31.clone(), adj32], 3));
        assert!(change.topology_changed);
        assert_eq!(change.added_links.len(), 2);

        assert_eq!(state.links_from_node("node1").len(), 2);
        assert_eq!(state.links_from_node("node2").len(), 2);
        assert_eq!(state.links_from_node("node3").len(), 2);
        assert!(state.links_from_node("node4").is_empty());

        // Overload flips are topology changes; repeats are not.
        assert!(!state.is_node_overloaded("node1"));
        let mut overloaded_db = create_adj_db("node1", vec![adj12.clone(), adj13.clone()], 1);
        overloaded_db.is_overloaded = true;
        assert!(state.update_adjacency_database(overloaded_db.clone()).topology_changed);
        assert!(state.is_node_overloaded("node1"));
        assert!(!state.update_adjacency_database(overloaded_db).topology_changed);
        assert!(
            state
                .update_adjacency_database(create_adj_db(
                    "node1",
                    vec![adj12.clone(), adj13.clone()],
                    1
                ))
                .topology_changed
        );
        assert!(!state.is_node_overloaded("node1"));

        // Dropping an adjacency removes the link.
        let change = state.update_adjacency_database(create_adj_db("node1", vec![adj13], 1));
        assert!(change.topology_changed);
        assert_eq!(change.removed_links.len(), 1);
        assert_eq!(state.links_from_node("node1").len(), 1);
        assert_eq!(state.links_from_node("node2").len(), 1);

        // Deleting the database removes the node entirely.
        assert!(state.delete_adjacency_database("node1").topology_changed);
        assert!(state.links_from_node("node1").is_empty());
        assert_eq!(state.links_from_node("node2").len(), 1);
        assert_eq!(state.links_from_node("node3").len(), 1);
    }

    #[test]
    fn test_metric_change_invalidates_spf() {
        let mut state = link_state_from_topology(&[
            (1, &[(2, 1)]),
            (2, &[(1, 1), (3, 1)]),
            (3, &[(2, 1)]),
        ]);
        let spf = state.get_spf_result("1", true);
        assert_eq!(spf["3"].metric, 2);

        // Raise the 1-2 metric from node 1's side.
        let adj = create_adjacency("2", "2/1/0", "1/2/0", 10);
        let change = state.update_adjacency_database(create_adj_db("1", vec![adj], 1));
        assert!(change.topology_changed);
        let spf = state.get_spf_result("1", true);
        assert_eq!(spf["3"].metric, 11);
    }

    #[test]
    fn test_spf_linear_topology() {
        // A - B - C - D with unit metrics.
        let mut state = link_state_from_topology(&[
            (1, &[(2, 1)]),
            (2, &[(1, 1), (3, 1)]),
            (3, &[(2, 1), (4, 1)]),
            (4, &[(3, 1)]),
        ]);
        let spf = state.get_spf_result("1", true);

        assert_eq!(spf["2"].metric, 1);
        assert_eq!(spf["2"].next_hops, BTreeSet::from(["2".to_string()]));
        assert_eq!(spf["3"].metric, 2);
        assert_eq!(spf["3"].next_hops, BTreeSet::from(["2".to_string()]));
        assert_eq!(spf["4"].metric, 3);
        assert_eq!(spf["4"].next_hops, BTreeSet::from(["2".to_string()]));
    }

    #[test]
    fn test_spf_ecmp_records_all_paths() {
        // Diamond with equal-cost sides.
        let mut state = link_state_from_topology(&[
            (1, &[(2, 1), (3, 1)]),
            (2, &[(1, 1), (4, 1)]),
            (3, &[(1, 1), (4, 1)]),
            (4, &[(2, 1), (3, 1)]),
        ]);
        let spf = state.get_spf_result("1", true);
        assert_eq!(spf["4"].metric, 2);
        assert_eq!(spf["4"].next_hops, BTreeSet::from(["2".to_string(), "3".to_string()]));
        assert_eq!(spf["4"].path_links.len(), 2);
    }

    #[test]
    fn test_spf_overloaded_node_terminates_but_no_transit() {
        let mut state = link_state_from_topology(&[
            (1, &[(2, 1)]),
            (2, &[(1, 1), (3, 1)]),
            (3, &[(2, 1)]),
        ]);
        let mut db = state.adjacency_databases()["2"].clone();
        db.is_overloaded = true;
        state.update_adjacency_database(db);

        let spf = state.get_spf_result("1", true);
        // Node 2 still reachable (terminating traffic)...
        assert_eq!(spf["2"].metric, 1);
        // ...but offers no transit toward node 3.
        assert!(!spf.contains_key("3"));
    }

    #[test]
    fn test_spf_from_overloaded_source_still_routes() {
        let mut state = link_state_from_topology(&[
            (1, &[(2, 1)]),
            (2, &[(1, 1), (3, 1)]),
            (3, &[(2, 1)]),
        ]);
        let mut db = state.adjacency_databases()["1"].clone();
        db.is_overloaded = true;
        state.update_adjacency_database(db);

        let spf = state.get_spf_result("1", true);
        assert_eq!(spf["3"].metric, 2);
    }

    #[test]
    fn test_path_a_in_path_b() {
        let (l1, l2, l3) = (LinkId(1), LinkId(2), LinkId(3));
        let (mut p1, mut p2): (Path, Path) = (Vec::new(), Vec::new());

        assert!(LinkState::path_a_in_path_b(&p1, &p2));
        assert!(LinkState::path_a_in_path_b(&p2, &p1));

        p1.push(l1);
        assert!(!LinkState::path_a_in_path_b(&p1, &p2));
        assert!(LinkState::path_a_in_path_b(&p2, &p1));

        p2.push(l1);
        assert!(LinkState::path_a_in_path_b(&p1, &p2));
        assert!(LinkState::path_a_in_path_b(&p2, &p1));

        p1.push(l2);
        assert!(!LinkState::path_a_in_path_b(&p1, &p2));
        assert!(LinkState::path_a_in_path_b(&p2, &p1));

        p1.push(l3);
        p2.push(l2);
        assert!(!LinkState::path_a_in_path_b(&p1, &p2));
        assert!(LinkState::path_a_in_path_b(&p2, &p1));

        let p1: Path = vec![l3, l2];
        let p2: Path = vec![l1];
        assert!(!LinkState::path_a_in_path_b(&p1, &p2));
        assert!(!LinkState::path_a_in_path_b(&p2, &p1));
    }

    #[test]
    fn test_kth_paths_square_topology() {
        //      10
        //   1------2
        //   |      |\
        //  5|   15 | | 35
        //   |      |/
        //   3------4
        //      20
        let mut state = link_state_from_topology(&[
            (1, &[(2, 10), (3, 5)]),
            (2, &[(1, 10), (4, 15), (4, 35)]),
            (3, &[(1, 5), (4, 20)]),
            (4, &[(2, 15), (3, 20), (2, 35)]),
        ]);

        let first_paths = state.get_kth_paths("2", "4", 1);
        assert_eq!(first_paths.len(), 1);
        assert_eq!(first_paths[0].len(), 1);
        assert_eq!(state.link(first_paths[0][0]).metric_from_node("2"), 15);

        let second_paths = state.get_kth_paths("2", "4", 2);
        assert_eq!(second_paths.len(), 2);
        let mut sizes: Vec<usize> = second_paths.iter().map(Vec::len).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 3]);
        // Both second paths cost 35.
        for path in second_paths.iter() {
            let mut next_node = "2".to_string();
            let mut dist = 0;
            for link in path {
                dist += state.link(*link).metric_from_node(&next_node);
                next_node = state.link(*link).other_node(&next_node).to_string();
            }
            assert_eq!(dist, 35);
        }
    }

    #[test]
    fn test_kth_paths_full_mesh_edge_disjoint() {
        // Full mesh with parallel links, hop-count metrics.
        let mut state = link_state_from_topology(&[
            (1, &[(2, 1), (2, 1), (3, 1), (3, 1), (4, 1), (4, 1)]),
            (2, &[(1, 1), (1, 1), (3, 1), (3, 1), (4, 1), (4, 1)]),
            (3, &[(1, 1), (1, 1), (2, 1), (2, 1), (4, 1), (4, 1)]),
            (4, &[(1, 1), (1, 1), (2, 1), (2, 1), (3, 1), (3, 1)]),
        ]);

        let first_paths = state.get_kth_paths("2", "4", 1);
        assert_eq!(first_paths.len(), 2);
        assert!(first_paths.iter().all(|p| p.len() == 1));

        let second_paths = state.get_kth_paths("2", "4", 2);
        assert_eq!(second_paths.len(), 4);
        assert!(second_paths.iter().all(|p| p.len() == 2));

        // All returned paths are mutually edge-disjoint.
        let mut seen = BTreeSet::new();
        for path in first_paths.iter().chain(second_paths.iter()) {
            for link in path {
                assert!(seen.insert(*link));
            }
        }
    }

    #[test]
    fn test_ksp2_diamond_unequal_sides() {
        // A=1, B=2, C=3, D=4 with A-B(10), A-C(5), B-D(15), C-D(20).
        let mut state = link_state_from_topology(&[
            (1, &[(2, 10), (3, 5)]),
            (2, &[(1, 10), (4, 15)]),
            (3, &[(1, 5), (4, 20)]),
            (4, &[(2, 15), (3, 20)]),
        ]);

        let first = state.get_kth_paths("1", "4", 1);
        assert_eq!(first.len(), 1);
        // First path goes via C (metric 25).
        let via: Vec<&str> = vec![
            state.link(first[0][0]).other_node("1"),
        ];
        assert_eq!(via, vec!["3"]);

        let second = state.get_kth_paths("1", "4", 2);
        assert_eq!(second.len(), 1);
        assert_eq!(state.link(second[0][0]).other_node("1"), "2");

        // Both paths cost 25.
        for path in first.iter().chain(second.iter()) {
            let mut node = "1".to_string();
            let mut dist = 0;
            for link in path {
                dist += state.link(*link).metric_from_node(&node);
                node = state.link(*link).other_node(&node).to_string();
            }
            assert_eq!(dist, 25);
        }
    }

    fn node_ucmp_weights(node: &UcmpNode) -> Vec<(String, i64)> {
        node.next_hop_links.iter().map(|nh| (nh.if_name.clone(), nh.weight)).collect()
    }

    #[test]
    fn test_ucmp_adj_weight_propagation() {
        // w:2     w:1  w:1
        //  (4)    (5)  (6)
        //    \   /   /   /
        //     \ /   /   /
        //     ( 2 )/  (3)
        //       \     /
        //        \   /
        //        ( 1 )
        let mut state = link_state_from_topology(&[
            (1, &[(2, 1), (3, 1)]),
            (2, &[(1, 1), (4, 1), (5, 1), (6, 1)]),
            (3, &[(1, 1), (6, 1)]),
            (4, &[(2, 1)]),
            (5, &[(2, 1)]),
            (6, &[(2, 1), (3, 1)]),
        ]);
        let w = DEFAULT_ADJ_WEIGHT;
        let spf = state.get_spf_result("1", true);
        let ucmp = state.resolve_ucmp_weights(
            &spf,
            &BTreeMap::from([
                ("4".to_string(), 2 * w),
                ("5".to_string(), w),
                ("6".to_string(), w),
            ]),
            ForwardingAlgorithm::SpUcmpAdjWeightPropagation,
            true,
        );

        assert_eq!(ucmp.len(), 6);

        let mut at2 = node_ucmp_weights(&ucmp["2"]);
        at2.sort();
        assert_eq!(
            at2,
            vec![
                ("2/4/0".to_string(), 2 * w),
                ("2/5/0".to_string(), w),
                ("2/6/0".to_string(), w)
            ]
        );
        // AWP: advertised weight is the sum of next-hop link weights.
        assert_eq!(ucmp["2"].weight, Some(3 * w));

        assert_eq!(node_ucmp_weights(&ucmp["3"]), vec![("3/6/0".to_string(), w)]);
        assert_eq!(ucmp["3"].weight, Some(w));

        let mut at1 = node_ucmp_weights(&ucmp["1"]);
        at1.sort();
        assert_eq!(at1, vec![("1/2/0".to_string(), 3 * w), ("1/3/0".to_string(), w)]);
        assert_eq!(ucmp["1"].weight, Some(2 * w));
    }

    #[test]
    fn test_ucmp_prefix_weight_propagation() {
        let mut state = link_state_from_topology(&[
            (1, &[(2, 1), (3, 1)]),
            (2, &[(1, 1), (4, 1), (5, 1), (6, 1)]),
            (3, &[(1, 1), (6, 1)]),
            (4, &[(2, 1)]),
            (5, &[(2, 1)]),
            (6, &[(2, 1), (3, 1)]),
        ]);
        let w = DEFAULT_ADJ_WEIGHT;
        let spf = state.get_spf_result("1", true);
        let ucmp = state.resolve_ucmp_weights(
            &spf,
            &BTreeMap::from([
                ("4".to_string(), 2 * w),
                ("5".to_string(), w),
                ("6".to_string(), w),
            ]),
            ForwardingAlgorithm::SpUcmpPrefixWeightPropagation,
            true,
        );

        assert_eq!(ucmp.len(), 6);

        // PWP: advertised weight is the sum of next-hop prefix weights.
        assert_eq!(ucmp["2"].weight, Some(4 * w));
        assert_eq!(ucmp["3"].weight, Some(w));

        let mut at1 = node_ucmp_weights(&ucmp["1"]);
        at1.sort();
        assert_eq!(at1, vec![("1/2/0".to_string(), 4 * w), ("1/3/0".to_string(), w)]);
        assert_eq!(ucmp["1"].weight, Some(5 * w));
    }

    #[test]
    fn test_ucmp_with_costs_and_parallel_links() {
        //  w:4    w:2   w:1
        //  (3)    (4)   (5)
        //    \   /     / /
        //     \ /     / /
        //     (2)    / / cost=2
        //       \   / /
        //        \ / /
        //        (1)
        let mut state = link_state_from_topology(&[
            (1, &[(2, 1), (5, 2), (5, 2)]),
            (2, &[(1, 1), (3, 1), (4, 1)]),
            (3, &[(2, 1)]),
            (4, &[(2, 1)]),
            (5, &[(1, 2), (1, 2)]),
        ]);
        let w = DEFAULT_ADJ_WEIGHT;
        let spf = state.get_spf_result("1", true);
        let ucmp = state.resolve_ucmp_weights(
            &spf,
            &BTreeMap::from([
                ("3".to_string(), 4 * w),
                ("4".to_string(), 2 * w),
                ("5".to_string(), w),
            ]),
            ForwardingAlgorithm::SpUcmpPrefixWeightPropagation,
            true,
        );

        // Node 2's next-hop weights normalize by their GCD (2w).
        let mut at2 = node_ucmp_weights(&ucmp["2"]);
        at2.sort();
        assert_eq!(at2, vec![("2/3/0".to_string(), 2 * w), ("2/4/0".to_string(), w)]);
        assert_eq!(ucmp["2"].weight, Some(6 * w));

        let mut at1 = node_ucmp_weights(&ucmp["1"]);
        at1.sort();
        assert_eq!(
            at1,
            vec![
                ("1/2/0".to_string(), 6 * w),
                ("1/5/0".to_string(), w),
                ("1/5/1".to_string(), w)
            ]
        );
        assert_eq!(ucmp["1"].weight, Some(8 * w));
    }

    #[test]
    fn test_ucmp_rejects_non_equidistant_leaves() {
        let mut state = link_state_from_topology(&[
            (1, &[(2, 1), (3, 2)]),
            (2, &[(1, 1)]),
            (3, &[(1, 2)]),
        ]);
        let spf = state.get_spf_result("1", true);
        let ucmp = state.resolve_ucmp_weights(
            &spf,
            &BTreeMap::from([("2".to_string(), 1), ("3".to_string(), 1)]),
            ForwardingAlgorithm::SpUcmpAdjWeightPropagation,
            true,
        );
        assert!(ucmp.is_empty());
    }

    #[test]
    fn test_holds_are_dormant_by_default() {
        let mut state = link_state_from_topology(&[(1, &[(2, 1)]), (2, &[(1, 1)])]);
        assert!(!state.has_holds());
        // With no holds armed, decrementing changes nothing.
        assert!(!state.decrement_holds().topology_changed);
        let spf = state.get_spf_result("1", true);
        assert_eq!(spf["2"].metric, 1);
    }

    #[test]
    fn test_metric_from_a_to_b() {
        let mut state = link_state_from_topology(&[
            (1, &[(2, 3)]),
            (2, &[(1, 3), (3, 4)]),
            (3, &[(2, 4)]),
        ]);
        assert_eq!(state.get_metric_from_a_to_b("1", "1", true), Some(0));
        assert_eq!(state.get_metric_from_a_to_b("1", "3", true), Some(7));
        assert_eq!(state.get_metric_from_a_to_b("1", "9", true), None);
        // Hop-count mode.
        assert_eq!(state.get_metric_from_a_to_b("1", "3", false), Some(2));
    }
}
