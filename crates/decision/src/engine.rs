//! Decision engine event loop.
//!
//! Subscribes to the KvStore publication stream, decodes adjacency and
//! prefix databases out of the well-known keys, applies them to the
//! per-area [`LinkState`] and the [`PrefixState`], and rebuilds the route
//! database after a debounce window. Only the delta between successive
//! computations is emitted; the FIB programmer consumes it downstream.

use std::collections::BTreeMap;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trellis_types::codec;
use trellis_types::config::DecisionConfig;
use trellis_types::metrics::SharedMetricSink;
use trellis_types::{
    AdjacencyDatabase, PrefixDatabase, Publication, RouteUpdate, parse_adjacency_db_key,
    parse_prefix_db_key,
};

use crate::link_state::LinkState;
use crate::prefix_state::PrefixState;
use crate::route_db::RouteDb;
use crate::spf_solver::SpfSolver;

const METRIC_ADJ_DB_UPDATES: &str = "decision_adj_db_update_total";
const METRIC_PREFIX_DB_UPDATES: &str = "decision_prefix_db_update_total";
const METRIC_INCORRECT_ADVERTISEMENTS: &str = "decision_incorrect_advertisement_total";

/// The decision engine state: per-area graphs, prefix table, solver, and
/// the last computed route database.
pub struct Decision {
    my_node_name: String,
    config: DecisionConfig,
    areas: BTreeMap<String, LinkState>,
    prefix_state: PrefixState,
    solver: SpfSolver,
    route_db: RouteDb,
    metrics: SharedMetricSink,
}

impl Decision {
    /// Creates an engine for the local node.
    pub fn new(
        my_node_name: impl Into<String>,
        config: DecisionConfig,
        metrics: SharedMetricSink,
    ) -> Self {
        let my_node_name = my_node_name.into();
        let solver =
            SpfSolver::new(my_node_name.clone(), config.clone(), SharedMetricSink::clone(&metrics));
        Self {
            my_node_name,
            config,
            areas: BTreeMap::new(),
            prefix_state: PrefixState::new(),
            solver,
            route_db: RouteDb::new(),
            metrics,
        }
    }

    /// Read access to the last computed route database.
    pub fn route_db(&self) -> &RouteDb {
        &self.route_db
    }

    /// Read access to the solver (static route overlay).
    pub fn solver_mut(&mut self) -> &mut SpfSolver {
        &mut self.solver
    }

    /// Spawns the engine loop on the current runtime.
    pub fn spawn(
        self,
        publications: broadcast::Receiver<Publication>,
        route_updates_tx: mpsc::UnboundedSender<RouteUpdate>,
        stop_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(publications, route_updates_tx, stop_rx))
    }

    /// Runs the engine loop until the stop signal fires.
    pub async fn run(
        mut self,
        mut publications: broadcast::Receiver<Publication>,
        route_updates_tx: mpsc::UnboundedSender<RouteUpdate>,
        mut stop_rx: broadcast::Receiver<()>,
    ) {
        info!(node = %self.my_node_name, "decision engine started");
        // Debounce bookkeeping: first pending change and the sliding
        // rebuild deadline.
        let mut first_pending: Option<Instant> = None;
        let mut rebuild_at: Option<Instant> = None;

        loop {
            let deadline = rebuild_at
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + std::time::Duration::from_secs(3600));
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = tokio::time::sleep_until(deadline), if rebuild_at.is_some() => {
                    first_pending = None;
                    rebuild_at = None;
                    if let Some(update) = self.rebuild() {
                        if route_updates_tx.send(update).is_err() {
                            break;
                        }
                    }
                }
                publication = publications.recv() => {
                    let publication = match publication {
                        Ok(publication) => publication,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "decision lagged behind kvstore publications");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    if self.apply_publication(&publication) {
                        let now = Instant::now();
                        let first = *first_pending.get_or_insert(now);
                        rebuild_at =
                            Some((now + self.config.debounce_min).min(first + self.config.debounce_max));
                    }
                }
            }
        }
        info!(node = %self.my_node_name, "decision engine stopped");
    }

    /// Applies one publication; returns true when anything relevant to
    /// route computation changed.
    pub fn apply_publication(&mut self, publication: &Publication) -> bool {
        let area = publication.area.clone();
        let mut changed = false;

        for (key, value) in &publication.key_vals {
            // Pure TTL refreshes carry no payload and no content change.
            let Some(bytes) = &value.value else { continue };

            if let Some(node) = parse_adjacency_db_key(key) {
                let db: AdjacencyDatabase = match codec::decode(bytes) {
                    Ok(db) => db,
                    Err(error) => {
                        warn!(key = %key, %error, "undecodable adjacency database");
                        continue;
                    }
                };
                if db.this_node_name != node {
                    warn!(key = %key, node = %db.this_node_name, "adjacency database key mismatch");
                    self.metrics.increment(METRIC_INCORRECT_ADVERTISEMENTS, 1);
                    continue;
                }
                self.metrics.increment(METRIC_ADJ_DB_UPDATES, 1);
                let link_state =
                    self.areas.entry(area.clone()).or_insert_with(|| LinkState::new(area.clone()));
                let change = link_state.update_adjacency_database(db);
                debug!(
                    area = %area,
                    node = %node,
                    topology_changed = change.topology_changed,
                    "adjacency database applied"
                );
                changed |= change.topology_changed
                    || change.node_label_changed
                    || change.link_attributes_changed;
            } else if let Some(node) = parse_prefix_db_key(key) {
                let mut db: PrefixDatabase = match codec::decode(bytes) {
                    Ok(db) => db,
                    Err(error) => {
                        warn!(key = %key, %error, "undecodable prefix database");
                        continue;
                    }
                };
                if db.this_node_name != node {
                    warn!(key = %key, node = %db.this_node_name, "prefix database key mismatch");
                    self.metrics.increment(METRIC_INCORRECT_ADVERTISEMENTS, 1);
                    continue;
                }
                self.metrics.increment(METRIC_PREFIX_DB_UPDATES, 1);
                db.area = area.clone();
                changed |= !self.prefix_state.update_prefix_database(db).is_empty();
            }
        }

        for key in &publication.expired_keys {
            if let Some(node) = parse_adjacency_db_key(key) {
                if let Some(link_state) = self.areas.get_mut(&area) {
                    changed |= link_state.delete_adjacency_database(node).topology_changed;
                }
            } else if let Some(node) = parse_prefix_db_key(key) {
                changed |= !self.prefix_state.delete_prefix_database(node, &area).is_empty();
            }
        }

        changed
    }

    /// Recomputes the route database and returns the delta from the
    /// previous computation, if any.
    pub fn rebuild(&mut self) -> Option<RouteUpdate> {
        let new_db = self.solver.build_route_db(&mut self.areas, &self.prefix_state)?;
        let delta = self.route_db.calculate_update(&new_db);
        self.route_db = new_db;
        if delta.is_empty() {
            return None;
        }
        info!(
            unicast_updates = delta.unicast_to_update.len(),
            unicast_deletes = delta.unicast_to_delete.len(),
            mpls_updates = delta.mpls_to_update.len(),
            mpls_deletes = delta.mpls_to_delete.len(),
            "route database updated"
        );
        Some(delta)
    }
}
