//! Per-area key-value database.
//!
//! `KvStoreDb` is the single-owner state machine behind one area's event
//! loop: the key-value map, the TTL countdown queue, the peer set with its
//! FSM, the self-originated key cache, and the flood rate limiter. It is
//! deliberately synchronous — methods mutate state and return
//! [`PeerCommand`]s describing the RPCs the owning task must issue, which
//! keeps every rule unit-testable without a runtime.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use trellis_types::config::KvStoreConfig;
use trellis_types::metrics::SharedMetricSink;
use trellis_types::{
    AreaSummary, FilterOperator, FullSyncRequest, KeyDumpParams, KeySetParams, KvStoreFilters,
    MergeReason, PeerState, PeersMap, Publication, TTL_INFINITY, Value,
    net::ADJ_DB_KEY_PREFIX,
};

use crate::client::{PeerClient, PeerClientFactory};
use crate::merge::merge_key_values;
use crate::peer::{Peer, PeerEvent};
use crate::rate_limit::FloodLimiter;
use crate::ttl_queue::TtlQueue;

/// Throttle window coalescing self-originated key advertisements.
pub const SELF_ADVERTISE_THROTTLE: Duration = Duration::from_millis(100);

/// Throttle window coalescing self-originated key unsets.
pub const SELF_UNSET_THROTTLE: Duration = Duration::from_millis(100);

/// Interval between keep-alive probes to initialized peers.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between flood-topology debug dumps.
pub const FLOOD_TOPO_DUMP_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between adjacency-key TTL audits.
pub const KEY_TTL_AUDIT_INTERVAL: Duration = Duration::from_secs(60);

/// Ceiling for the per-area parallel full-sync limit.
pub const MAX_PARALLEL_SYNCS: usize = 32;

/// Initial per-area parallel full-sync limit; doubles per successful sync.
pub const INITIAL_PARALLEL_SYNCS: usize = 2;

const METRIC_RECEIVED_PUBLICATIONS: &str = "kvstore_received_publications_total";
const METRIC_RECEIVED_KEY_VALS: &str = "kvstore_received_key_vals_total";
const METRIC_UPDATED_KEY_VALS: &str = "kvstore_updated_key_vals_total";
const METRIC_SENT_PUBLICATIONS: &str = "kvstore_sent_publications_total";
const METRIC_FLOOD_BUFFERED: &str = "kvstore_flood_buffered_total";
const METRIC_EXPIRED_KEYS: &str = "kvstore_expired_keys_total";
const METRIC_PEER_API_ERRORS: &str = "kvstore_peer_api_errors_total";
const METRIC_INCONSISTENCIES: &str = "kvstore_peer_inconsistencies_total";
const METRIC_LOOPS_DETECTED: &str = "kvstore_flood_loops_detected_total";
const METRIC_FULL_SYNC_SECONDS: &str = "kvstore_full_sync_duration_seconds";

/// An RPC the owning event loop must issue on behalf of the database.
pub enum PeerCommand {
    /// Initiate a three-way full sync with a peer.
    FullSync {
        /// Peer name.
        peer: String,
        /// Transport client.
        client: Arc<dyn PeerClient>,
        /// Key-hash dump to send.
        request: FullSyncRequest,
    },
    /// Send the final leg of a full sync back to its responder.
    FinalizeFullSync {
        /// Peer name.
        peer: String,
        /// Transport client.
        client: Arc<dyn PeerClient>,
        /// Values the responder asked for.
        params: KeySetParams,
    },
    /// Flood a merged delta to one peer.
    Flood {
        /// Peer name.
        peer: String,
        /// Transport client.
        client: Arc<dyn PeerClient>,
        /// Delta to flood.
        params: KeySetParams,
    },
    /// Probe a peer to keep the transport channel open.
    KeepAlive {
        /// Peer name.
        peer: String,
        /// Transport client.
        client: Arc<dyn PeerClient>,
    },
}

impl std::fmt::Debug for PeerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FullSync { peer, .. } => write!(f, "FullSync({peer})"),
            Self::FinalizeFullSync { peer, .. } => write!(f, "FinalizeFullSync({peer})"),
            Self::Flood { peer, .. } => write!(f, "Flood({peer})"),
            Self::KeepAlive { peer, .. } => write!(f, "KeepAlive({peer})"),
        }
    }
}

/// Outcome of merging one publication into the database.
#[derive(Debug, Default)]
pub struct MergeResult {
    /// Merged delta for local subscribers; empty when nothing changed.
    pub delta: Publication,
    /// Per-key rejection reasons for the caller.
    pub no_merge_reasons: BTreeMap<String, MergeReason>,
    /// Floods to issue.
    pub commands: Vec<PeerCommand>,
    /// Sender that reported a stale view of a self-originated key and must
    /// be resynced.
    pub inconsistent_sender: Option<String>,
}

/// Result of processing a full-sync response from a peer.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    /// Merge outcome of the response publication.
    pub merge: MergeResult,
    /// Extra commands (the finalize leg).
    pub commands: Vec<PeerCommand>,
    /// Initial-sync completion signal, if this response completed it:
    /// `true` for success, `false` for completion-with-errors.
    pub initial_sync_done: Option<bool>,
}

/// A self-originated key-value the node refreshes indefinitely.
#[derive(Debug, Clone)]
pub struct SelfOriginatedValue {
    /// The advertised value.
    pub value: Value,
    /// Next scheduled TTL refresh.
    pub ttl_refresh_at: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    received_publications: i64,
    received_key_vals: i64,
    updated_key_vals: i64,
    sent_publications: i64,
    flood_buffered: i64,
    expired_keys: i64,
    peer_api_errors: i64,
    inconsistencies: i64,
    loops_detected: i64,
    rejected_old_version: i64,
    rejected_no_need: i64,
    rejected_invalid_ttl: i64,
    rejected_no_matched_key: i64,
}

/// One area's key-value database and peer collection.
pub struct KvStoreDb {
    node_id: String,
    area: String,
    config: Arc<KvStoreConfig>,
    filters: Option<KvStoreFilters>,
    kv_store: BTreeMap<String, Value>,
    ttl_queue: TtlQueue,
    peers: BTreeMap<String, Peer>,
    self_originated: BTreeMap<String, SelfOriginatedValue>,
    keys_to_advertise: BTreeSet<String>,
    keys_to_unset: BTreeMap<String, Value>,
    flood_limiter: Option<FloodLimiter>,
    buffered_keys: BTreeSet<String>,
    parallel_sync_limit: usize,
    initial_sync_completed: bool,
    client_factory: Arc<dyn PeerClientFactory>,
    metrics: SharedMetricSink,
    counters: Counters,
}

impl KvStoreDb {
    /// Creates an empty database for `area`.
    pub fn new(
        area: impl Into<String>,
        config: Arc<KvStoreConfig>,
        client_factory: Arc<dyn PeerClientFactory>,
        metrics: SharedMetricSink,
    ) -> Self {
        let filters = config.set_leaf_node.then(|| {
            KvStoreFilters::new(
                config.key_prefix_filters.clone(),
                config.key_originator_id_filters.iter().cloned(),
                FilterOperator::Or,
            )
        });
        let flood_limiter = config.flood_rate.map(FloodLimiter::new);
        Self {
            node_id: config.node_name.clone(),
            area: area.into(),
            config,
            filters,
            kv_store: BTreeMap::new(),
            ttl_queue: TtlQueue::new(),
            peers: BTreeMap::new(),
            self_originated: BTreeMap::new(),
            keys_to_advertise: BTreeSet::new(),
            keys_to_unset: BTreeMap::new(),
            flood_limiter,
            buffered_keys: BTreeSet::new(),
            parallel_sync_limit: INITIAL_PARALLEL_SYNCS,
            initial_sync_completed: false,
            client_factory,
            metrics,
            counters: Counters::default(),
        }
    }

    /// Area this database serves.
    pub fn area(&self) -> &str {
        &self.area
    }

    /// Number of configured peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// True once the initial sync with all peers has concluded.
    pub fn initial_sync_completed(&self) -> bool {
        self.initial_sync_completed
    }

    /// Read access to the live key-value map (event-loop internal).
    pub fn key_vals(&self) -> &BTreeMap<String, Value> {
        &self.kv_store
    }

    // ========================================================================
    // Merge and flood
    // ========================================================================

    /// Merges a publication into the store and prepares onward floods.
    pub fn set_key_vals(&mut self, params: KeySetParams, now: Instant) -> MergeResult {
        self.counters.received_publications += 1;
        self.counters.received_key_vals += params.key_vals.len() as i64;
        self.metrics.increment(METRIC_RECEIVED_PUBLICATIONS, 1);
        self.metrics.increment(METRIC_RECEIVED_KEY_VALS, params.key_vals.len() as u64);

        let mut result = MergeResult::default();

        // Loop suppression: a publication that already carries our id has
        // travelled a cycle and must not be merged again.
        if params.node_ids.iter().any(|n| n == &self.node_id) {
            self.counters.loops_detected += 1;
            self.metrics.increment(METRIC_LOOPS_DETECTED, 1);
            for key in params.key_vals.into_keys() {
                result.no_merge_reasons.insert(key, MergeReason::LoopDetected);
            }
            return result;
        }

        let outcome =
            merge_key_values(&mut self.kv_store, params.key_vals, self.filters.as_ref(), &self.node_id);

        self.counters.updated_key_vals += outcome.updates.len() as i64;
        self.metrics.increment(METRIC_UPDATED_KEY_VALS, outcome.updates.len() as u64);
        for reason in outcome.no_merge_reasons.values() {
            match reason {
                MergeReason::OldVersion => self.counters.rejected_old_version += 1,
                MergeReason::NoNeedToUpdate => self.counters.rejected_no_need += 1,
                MergeReason::InvalidTtl => self.counters.rejected_invalid_ttl += 1,
                MergeReason::NoMatchedKey => self.counters.rejected_no_matched_key += 1,
                MergeReason::LoopDetected => {}
            }
        }

        for (key, value) in &outcome.updates {
            self.ttl_queue.schedule(now, key, value);
        }

        self.process_publication_for_self_originated(&outcome.updates);

        if !outcome.stale_reports.is_empty() {
            if let Some(sender) = &params.sender_id {
                self.counters.inconsistencies += 1;
                self.metrics.increment(METRIC_INCONSISTENCIES, 1);
                warn!(
                    area = %self.area,
                    sender = %sender,
                    keys = ?outcome.stale_reports,
                    "peer reported stale view of self-originated keys"
                );
                result.inconsistent_sender = Some(sender.clone());
            }
        }

        // Keys that changed while a peer is still syncing are flooded to it
        // in the finalize leg instead.
        for peer in self.peers.values_mut() {
            if peer.state != PeerState::Initialized {
                peer.pending_keys_during_initialization
                    .extend(outcome.updates.keys().cloned());
            }
        }

        let mut delta = Publication::new(&self.area);
        delta.key_vals = outcome.updates;
        delta.node_ids = params.node_ids;

        result.commands = self.flood_publication(&delta);
        result.delta = delta;
        result.no_merge_reasons.extend(outcome.no_merge_reasons);
        result
    }

    /// Floods a delta to all eligible peers, or buffers it when the rate
    /// limiter has no tokens.
    fn flood_publication(&mut self, delta: &Publication) -> Vec<PeerCommand> {
        if delta.key_vals.is_empty() {
            return Vec::new();
        }

        if let Some(limiter) = &mut self.flood_limiter {
            if !limiter.try_acquire() {
                self.buffered_keys.extend(delta.key_vals.keys().cloned());
                self.counters.flood_buffered += 1;
                self.metrics.increment(METRIC_FLOOD_BUFFERED, 1);
                return Vec::new();
            }
        }

        let mut node_ids = delta.node_ids.clone();
        node_ids.push(self.node_id.clone());

        let key_vals = Self::decrement_ttls(delta.key_vals.clone(), self.config.ttl_decrement);
        if key_vals.is_empty() {
            return Vec::new();
        }

        let mut commands = Vec::new();
        for peer in self.peers.values() {
            if peer.state != PeerState::Initialized {
                continue;
            }
            if node_ids.iter().any(|n| n == &peer.node_name) {
                continue;
            }
            let Some(client) = peer.client.clone() else {
                continue;
            };
            commands.push(PeerCommand::Flood {
                peer: peer.node_name.clone(),
                client,
                params: KeySetParams {
                    key_vals: key_vals.clone(),
                    sender_id: Some(self.node_id.clone()),
                    node_ids: node_ids.clone(),
                },
            });
        }
        self.counters.sent_publications += commands.len() as i64;
        self.metrics.increment(METRIC_SENT_PUBLICATIONS, commands.len() as u64);
        commands
    }

    /// Applies the configured TTL decrement to an outbound copy, dropping
    /// entries whose TTL would no longer be positive.
    fn decrement_ttls(
        key_vals: BTreeMap<String, Value>,
        decrement: Duration,
    ) -> BTreeMap<String, Value> {
        let decrement_ms = decrement.as_millis() as i64;
        key_vals
            .into_iter()
            .filter_map(|(key, mut value)| {
                if value.ttl_ms != TTL_INFINITY {
                    value.ttl_ms -= decrement_ms;
                    if value.ttl_ms <= 0 {
                        return None;
                    }
                }
                Some((key, value))
            })
            .collect()
    }

    /// Re-floods updates that were buffered by the rate limiter. Buffered
    /// keys coalesce: one publication carries the latest value per key.
    pub fn drain_flood_buffer(&mut self) -> Vec<PeerCommand> {
        if self.buffered_keys.is_empty() {
            return Vec::new();
        }
        let mut publication = Publication::new(&self.area);
        for key in std::mem::take(&mut self.buffered_keys) {
            if let Some(value) = self.kv_store.get(&key) {
                publication.key_vals.insert(key, value.clone());
            }
        }
        let commands = self.flood_publication(&publication);
        if commands.is_empty() && !publication.key_vals.is_empty() {
            // Still rate limited; keys went back to the buffer.
            debug!(area = %self.area, "flood buffer drain re-throttled");
        }
        commands
    }

    /// Deadline for the next flood-buffer drain attempt, if any.
    pub fn next_flood_drain(&self, now: Instant) -> Option<Instant> {
        if self.buffered_keys.is_empty() {
            return None;
        }
        let wait = self.flood_limiter.as_ref().map(|l| l.retry_after()).unwrap_or_default();
        Some(now + wait)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Fetches a fixed set of keys.
    pub fn get_key_vals(&self, keys: &[String]) -> Publication {
        let mut publication = Publication::new(&self.area);
        for key in keys {
            if let Some(value) = self.kv_store.get(key) {
                publication.key_vals.insert(key.clone(), value.clone());
            }
        }
        publication
    }

    /// Filtered dump of the store.
    ///
    /// With `key_val_hashes` set this is a delta dump: only keys absent
    /// from the provided map or hashing differently are returned. Hash
    /// filtering applies before value stripping.
    pub fn dump_keys(&self, params: &KeyDumpParams) -> Publication {
        let mut publication = Publication::new(&self.area);
        for (key, value) in &self.kv_store {
            if !Self::dump_matches(params, key, &value.originator_id) {
                continue;
            }
            if let Some(hashes) = &params.key_val_hashes {
                if hashes.get(key) == value.hash.as_ref() {
                    continue;
                }
            }
            let value =
                if params.do_not_publish_value { value.without_value() } else { value.clone() };
            publication.key_vals.insert(key.clone(), value);
        }
        publication
    }

    /// Filtered dump with every payload stripped.
    pub fn dump_hashes(&self, params: &KeyDumpParams) -> Publication {
        let mut stripped = params.clone();
        stripped.do_not_publish_value = true;
        self.dump_keys(&stripped)
    }

    fn dump_matches(params: &KeyDumpParams, key: &str, originator: &str) -> bool {
        let key_match = params.keys.is_empty() || params.keys.iter().any(|p| key.starts_with(p));
        let originator_match = params.originator_ids.is_empty()
            || params.originator_ids.iter().any(|o| o == originator);
        match params.oper {
            FilterOperator::Or => {
                if params.keys.is_empty() {
                    originator_match
                } else if params.originator_ids.is_empty() {
                    key_match
                } else {
                    key_match || originator_match
                }
            }
            FilterOperator::And => key_match && originator_match,
        }
    }

    /// Snapshot of live self-originated key-values.
    pub fn dump_self_originated(&self) -> BTreeMap<String, Value> {
        self.self_originated.iter().map(|(k, v)| (k.clone(), v.value.clone())).collect()
    }

    /// Area summary for introspection.
    pub fn summary(&self) -> AreaSummary {
        let key_vals_bytes = self
            .kv_store
            .iter()
            .map(|(k, v)| k.len() + v.value.as_ref().map_or(0, Vec::len))
            .sum();
        AreaSummary {
            area: self.area.clone(),
            key_vals_count: self.kv_store.len(),
            key_vals_bytes,
            peers_count: self.peers.len(),
        }
    }

    /// Stat counters snapshot.
    pub fn counters(&self) -> BTreeMap<String, i64> {
        let c = &self.counters;
        BTreeMap::from([
            ("kvstore.received_publications".to_string(), c.received_publications),
            ("kvstore.received_key_vals".to_string(), c.received_key_vals),
            ("kvstore.updated_key_vals".to_string(), c.updated_key_vals),
            ("kvstore.sent_publications".to_string(), c.sent_publications),
            ("kvstore.flood_buffered".to_string(), c.flood_buffered),
            ("kvstore.expired_keys".to_string(), c.expired_keys),
            ("kvstore.peer_api_errors".to_string(), c.peer_api_errors),
            ("kvstore.inconsistencies".to_string(), c.inconsistencies),
            ("kvstore.loops_detected".to_string(), c.loops_detected),
            ("kvstore.rejected.old_version".to_string(), c.rejected_old_version),
            ("kvstore.rejected.no_need_to_update".to_string(), c.rejected_no_need),
            ("kvstore.rejected.invalid_ttl".to_string(), c.rejected_invalid_ttl),
            ("kvstore.rejected.no_matched_key".to_string(), c.rejected_no_matched_key),
            ("kvstore.num_keys".to_string(), self.kv_store.len() as i64),
            ("kvstore.num_peers".to_string(), self.peers.len() as i64),
            ("kvstore.ttl_queue_size".to_string(), self.ttl_queue.len() as i64),
        ])
    }

    // ========================================================================
    // TTL countdown
    // ========================================================================

    /// Deadline of the next TTL expiration, if any.
    pub fn next_ttl_deadline(&self) -> Option<Instant> {
        self.ttl_queue.next_deadline()
    }

    /// Expires every key whose countdown elapsed.
    ///
    /// Returns the expiration publication for local subscribers; expired
    /// keys are not flooded — every store expires independently, which the
    /// monotone TTL decrement makes safe.
    pub fn expire_keys(&mut self, now: Instant) -> Option<Publication> {
        let mut publication = Publication::new(&self.area);
        for entry in self.ttl_queue.pop_due(now) {
            let current = match self.kv_store.get(&entry.key) {
                Some(value) => TtlQueue::entry_is_current(&entry, value),
                None => false,
            };
            if current {
                self.kv_store.remove(&entry.key);
                publication.expired_keys.push(entry.key);
            }
        }
        if publication.expired_keys.is_empty() {
            return None;
        }
        self.counters.expired_keys += publication.expired_keys.len() as i64;
        self.metrics.increment(METRIC_EXPIRED_KEYS, publication.expired_keys.len() as u64);
        debug!(area = %self.area, count = publication.expired_keys.len(), "expired keys");
        Some(publication)
    }

    // ========================================================================
    // Peer management and full sync
    // ========================================================================

    /// Adds or updates peers. New peers start in IDLE and are picked up by
    /// the next sync pass.
    pub fn add_peers(&mut self, peers: PeersMap) {
        for (name, spec) in peers {
            match self.peers.get_mut(&name) {
                Some(existing) if existing.spec.peer_addr == spec.peer_addr => {
                    // Same endpoint; keep FSM state.
                    existing.spec = spec;
                }
                _ => {
                    info!(area = %self.area, peer = %name, "peer added");
                    self.peers.insert(name.clone(), Peer::new(name, spec));
                }
            }
        }
    }

    /// Removes peers. In-flight sync completions for them are dropped when
    /// they no longer resolve.
    pub fn del_peers(&mut self, peers: &[String]) {
        for name in peers {
            if self.peers.remove(name).is_some() {
                info!(area = %self.area, peer = %name, "peer removed");
            }
        }
    }

    /// Dump of all peers with their FSM state.
    pub fn dump_peers(&self) -> PeersMap {
        self.peers
            .iter()
            .map(|(name, peer)| {
                let mut spec = peer.spec.clone();
                spec.state = Some(peer.state);
                (name.clone(), spec)
            })
            .collect()
    }

    /// FSM state of one peer.
    pub fn peer_state(&self, peer: &str) -> Option<PeerState> {
        self.peers.get(peer).map(|p| p.state)
    }

    /// Promotes IDLE peers whose backoff elapsed into SYNCING, up to the
    /// parallel sync limit, and returns the full-sync RPCs to issue.
    pub fn request_peer_syncs(&mut self) -> Vec<PeerCommand> {
        let mut in_flight =
            self.peers.values().filter(|p| p.state == PeerState::Syncing).count();
        let mut commands = Vec::new();
        let key_val_hashes: BTreeMap<String, i64> = self
            .kv_store
            .iter()
            .filter_map(|(k, v)| v.hash.map(|h| (k.clone(), h)))
            .collect();

        let peer_names: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.state == PeerState::Idle && p.backoff.can_try_now())
            .map(|p| p.node_name.clone())
            .collect();

        for name in peer_names {
            if in_flight >= self.parallel_sync_limit {
                break;
            }
            let area = self.area.clone();
            let factory = Arc::clone(&self.client_factory);
            let Some(peer) = self.peers.get_mut(&name) else { continue };
            peer.sync_attempted = true;
            let client = match peer.client.clone() {
                Some(client) => client,
                None => match factory.create(&area, &name, &peer.spec) {
                    Ok(client) => {
                        peer.client = Some(Arc::clone(&client));
                        client
                    }
                    Err(error) => {
                        warn!(area = %self.area, peer = %name, %error, "client build failed");
                        peer.num_api_errors += 1;
                        self.counters.peer_api_errors += 1;
                        peer.backoff.report_error();
                        continue;
                    }
                },
            };
            peer.state = PeerState::Syncing;
            in_flight += 1;
            debug!(area = %self.area, peer = %name, keys = key_val_hashes.len(), "issuing full sync");
            commands.push(PeerCommand::FullSync {
                peer: name,
                client,
                request: FullSyncRequest {
                    area: self.area.clone(),
                    sender_id: self.node_id.clone(),
                    key_val_hashes: key_val_hashes.clone(),
                },
            });
        }
        commands
    }

    /// Deadline of the next sync retry, if any IDLE peer is waiting.
    pub fn next_sync_deadline(&self, now: Instant) -> Option<Instant> {
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Idle)
            .map(|p| p.backoff.retry_at().unwrap_or(now))
            .min()
    }

    /// Serves a peer-initiated full sync from the local store.
    ///
    /// The response carries our values whose hash differs on our side plus
    /// `tobe_updated_keys`: the keys the initiator holds that we lack or
    /// hold differently, which it will push back in the finalize leg.
    pub fn process_full_sync(&mut self, request: &FullSyncRequest) -> Publication {
        let mut response = Publication::new(&self.area);
        let mut tobe_updated = Vec::new();

        for (key, value) in &self.kv_store {
            match request.key_val_hashes.get(key) {
                None => {
                    response.key_vals.insert(key.clone(), value.clone());
                }
                Some(hash) if value.hash.as_ref() != Some(hash) => {
                    // Differing content: send ours and ask for theirs; the
                    // total order resolves the winner on both sides.
                    response.key_vals.insert(key.clone(), value.clone());
                    tobe_updated.push(key.clone());
                }
                Some(_) => {}
            }
        }
        for key in request.key_val_hashes.keys() {
            if !self.kv_store.contains_key(key) {
                tobe_updated.push(key.clone());
            }
        }

        response.key_vals = Self::decrement_ttls(response.key_vals, self.config.ttl_decrement);
        response.tobe_updated_keys = Some(tobe_updated);
        response
    }

    /// Processes a successful full-sync response from `peer`.
    pub fn process_sync_success(
        &mut self,
        peer_name: &str,
        response: Publication,
        rtt: Duration,
        now: Instant,
    ) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        if !self.peers.contains_key(peer_name) {
            // Peer deleted while the sync was in flight.
            return outcome;
        }

        info!(
            area = %self.area,
            peer = peer_name,
            keys = response.key_vals.len(),
            rtt_ms = rtt.as_millis() as u64,
            "full sync response merged"
        );
        self.metrics.observe(METRIC_FULL_SYNC_SECONDS, rtt.as_secs_f64());

        let tobe_updated = response.tobe_updated_keys.clone().unwrap_or_default();
        outcome.merge = self.set_key_vals(
            KeySetParams {
                key_vals: response.key_vals,
                sender_id: Some(peer_name.to_string()),
                node_ids: response.node_ids,
            },
            now,
        );

        if let Some(peer) = self.peers.get_mut(peer_name) {
            peer.apply_event(&self.area, PeerEvent::SyncRespRcvd);
            peer.backoff.report_success();

            // Finalize: push back our values for the keys the peer asked
            // for, plus anything that changed while it was syncing.
            let mut finalize_keys: BTreeSet<String> = tobe_updated.into_iter().collect();
            finalize_keys.extend(std::mem::take(&mut peer.pending_keys_during_initialization));
            let mut key_vals = BTreeMap::new();
            for key in finalize_keys {
                if let Some(value) = self.kv_store.get(&key) {
                    key_vals.insert(key, value.clone());
                }
            }
            let key_vals = Self::decrement_ttls(key_vals, self.config.ttl_decrement);
            if !key_vals.is_empty() {
                if let Some(client) = self.peers[peer_name].client.clone() {
                    outcome.commands.push(PeerCommand::FinalizeFullSync {
                        peer: peer_name.to_string(),
                        client,
                        params: KeySetParams {
                            key_vals,
                            sender_id: Some(self.node_id.clone()),
                            node_ids: vec![self.node_id.clone()],
                        },
                    });
                }
            }
        }

        // Smooth cold-start load: allow more parallel syncs after each
        // success.
        self.parallel_sync_limit = (self.parallel_sync_limit * 2).min(MAX_PARALLEL_SYNCS);

        outcome.initial_sync_done = self.check_initial_sync_completed();
        outcome
    }

    /// Processes a transport failure talking to `peer`.
    ///
    /// Returns the initial-sync completion signal if this failure
    /// concluded the bring-up (every peer attempted, none pending).
    pub fn process_sync_failure(&mut self, peer_name: &str) -> Option<bool> {
        let area = self.area.clone();
        if let Some(peer) = self.peers.get_mut(peer_name) {
            peer.num_api_errors += 1;
            self.counters.peer_api_errors += 1;
            self.metrics.increment(METRIC_PEER_API_ERRORS, 1);
            peer.apply_event(&area, PeerEvent::ThriftApiError);
            peer.backoff.report_error();
        }
        self.check_initial_sync_completed()
    }

    /// Tears down a peer that reported a stale view of a self-originated
    /// key; it will re-sync from IDLE.
    pub fn process_inconsistency(&mut self, peer_name: &str) {
        let area = self.area.clone();
        if let Some(peer) = self.peers.get_mut(peer_name) {
            peer.apply_event(&area, PeerEvent::InconsistencyDetected);
            peer.backoff.report_error();
        }
    }

    /// Keep-alive probes for every initialized peer.
    pub fn keep_alive_commands(&self) -> Vec<PeerCommand> {
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Initialized)
            .filter_map(|p| {
                p.client.clone().map(|client| PeerCommand::KeepAlive {
                    peer: p.node_name.clone(),
                    client,
                })
            })
            .collect()
    }

    fn check_initial_sync_completed(&mut self) -> Option<bool> {
        if self.initial_sync_completed {
            return None;
        }
        if self.peers.is_empty() {
            self.initial_sync_completed = true;
            return Some(true);
        }
        if self.peers.values().all(|p| p.state == PeerState::Initialized) {
            self.initial_sync_completed = true;
            return Some(true);
        }
        // Completion with errors: every peer has been attempted, none is
        // still in flight, and at least one keeps failing.
        let all_attempted = self.peers.values().all(|p| p.sync_attempted);
        let none_in_flight = self.peers.values().all(|p| p.state != PeerState::Syncing);
        let any_errors = self.peers.values().any(|p| p.num_api_errors > 0);
        if all_attempted && none_in_flight && any_errors {
            self.initial_sync_completed = true;
            return Some(false);
        }
        None
    }

    /// Marks initial sync completed for areas with no peers at startup.
    pub fn check_initial_sync_at_startup(&mut self) -> Option<bool> {
        self.check_initial_sync_completed()
    }

    // ========================================================================
    // Self-originated key management
    // ========================================================================

    /// Persists a self-originated key: wins over any competing
    /// advertisement and refreshes it indefinitely.
    pub fn persist_self_originated_key(&mut self, key: String, value: Vec<u8>, now: Instant) {
        if let Some(existing) = self.self_originated.get(&key) {
            if existing.value.value.as_deref() == Some(value.as_slice()) {
                // Already persisted with identical content.
                self.keys_to_advertise.insert(key);
                return;
            }
        }
        let base_version = self
            .kv_store
            .get(&key)
            .map(|v| v.version)
            .max(self.self_originated.get(&key).map(|v| v.value.version))
            .unwrap_or(0);
        let ttl_ms = self.config.key_ttl.as_millis() as i64;
        let new_value = Value::new(base_version + 1, self.node_id.clone(), Some(value), ttl_ms, 1);
        self.self_originated.insert(
            key.clone(),
            SelfOriginatedValue { value: new_value, ttl_refresh_at: self.next_refresh(now) },
        );
        self.keys_to_unset.remove(&key);
        self.keys_to_advertise.insert(key);
    }

    /// Sets a self-originated key at a specific version; version 0 means
    /// "one above the latest known".
    pub fn set_self_originated_key(
        &mut self,
        key: String,
        value: Vec<u8>,
        version: i64,
        now: Instant,
    ) {
        let version = if version == 0 {
            self.kv_store.get(&key).map(|v| v.version).unwrap_or(0) + 1
        } else {
            version
        };
        let ttl_ms = self.config.key_ttl.as_millis() as i64;
        let new_value = Value::new(version, self.node_id.clone(), Some(value), ttl_ms, 1);
        self.self_originated.insert(
            key.clone(),
            SelfOriginatedValue { value: new_value, ttl_refresh_at: self.next_refresh(now) },
        );
        self.keys_to_unset.remove(&key);
        self.keys_to_advertise.insert(key);
    }

    /// Publishes a final value for a self-originated key and stops
    /// refreshing it; the value then decays with its TTL.
    pub fn unset_self_originated_key(&mut self, key: String, value: Vec<u8>) {
        self.self_originated.remove(&key);
        self.keys_to_advertise.remove(&key);
        let version = self.kv_store.get(&key).map(|v| v.version).unwrap_or(0) + 1;
        let ttl_ms = self.config.key_ttl.as_millis() as i64;
        let final_value = Value::new(version, self.node_id.clone(), Some(value), ttl_ms, 1);
        self.keys_to_unset.insert(key, final_value);
    }

    /// Stops refreshing a self-originated key without publishing anything.
    pub fn erase_self_originated_key(&mut self, key: &str) {
        self.self_originated.remove(key);
        self.keys_to_advertise.remove(key);
    }

    /// True when a throttled advertisement pass is pending.
    pub fn has_pending_advertisements(&self) -> bool {
        !self.keys_to_advertise.is_empty() || !self.keys_to_unset.is_empty()
    }

    /// Advertises all pending self-originated keys in one batch.
    ///
    /// Versions are re-checked against the live store at advertisement
    /// time: a sync may have surfaced a higher version (e.g. from a
    /// previous incarnation of this node) since the request was queued.
    pub fn advertise_self_originated_keys(&mut self, now: Instant) -> MergeResult {
        let mut key_vals = BTreeMap::new();
        for key in std::mem::take(&mut self.keys_to_advertise) {
            let Some(entry) = self.self_originated.get_mut(&key) else { continue };
            if let Some(stored) = self.kv_store.get(&key) {
                if stored.originator_id != self.node_id && stored.version >= entry.value.version {
                    entry.value.version = stored.version + 1;
                    entry.value.update_hash();
                }
            }
            entry.ttl_refresh_at = now + self.config.key_ttl / 4;
            key_vals.insert(key, entry.value.clone());
        }

        // Batched unsets ride the same advertisement window.
        for (key, value) in std::mem::take(&mut self.keys_to_unset) {
            key_vals.insert(key, value);
        }

        if key_vals.is_empty() {
            return MergeResult::default();
        }
        self.set_key_vals(KeySetParams { key_vals, sender_id: None, node_ids: Vec::new() }, now)
    }

    /// Deadline of the next self-originated TTL refresh, if any.
    pub fn next_ttl_refresh(&self) -> Option<Instant> {
        self.self_originated.values().map(|v| v.ttl_refresh_at).min()
    }

    /// Publishes TTL refreshes for every self-originated key due at `now`.
    ///
    /// A refresh bumps `ttl_version`, restores the full TTL, and floods
    /// with the payload stripped — a TTL update, not a content change.
    pub fn advertise_ttl_updates(&mut self, now: Instant) -> MergeResult {
        let refresh_interval = self.config.key_ttl / 4;
        let ttl_ms = self.config.key_ttl.as_millis() as i64;
        let mut key_vals = BTreeMap::new();
        for (key, entry) in &mut self.self_originated {
            if entry.ttl_refresh_at > now {
                continue;
            }
            entry.value.ttl_version += 1;
            entry.value.ttl_ms = ttl_ms;
            entry.ttl_refresh_at = now + refresh_interval;
            key_vals.insert(key.clone(), entry.value.without_value());
        }
        if key_vals.is_empty() {
            return MergeResult::default();
        }
        self.set_key_vals(KeySetParams { key_vals, sender_id: None, node_ids: Vec::new() }, now)
    }

    /// Re-claims self-originated keys that a merge revealed to exist with
    /// a higher version — typically advertised by a previous incarnation
    /// of this node before a restart.
    fn process_publication_for_self_originated(&mut self, updates: &BTreeMap<String, Value>) {
        for (key, merged) in updates {
            if merged.value.is_none() {
                continue;
            }
            let Some(entry) = self.self_originated.get_mut(key) else { continue };
            if matches!(
                trellis_types::compare_values(merged, &entry.value),
                Some(std::cmp::Ordering::Greater)
            ) {
                info!(
                    area = %self.area,
                    key = %key,
                    seen_version = merged.version,
                    "re-claiming self-originated key above discovered version"
                );
                entry.value.version = merged.version + 1;
                entry.value.update_hash();
                self.keys_to_advertise.insert(key.clone());
            }
        }
    }

    fn next_refresh(&self, now: Instant) -> Instant {
        now + self.config.key_ttl / 4
    }

    // ========================================================================
    // Monitoring
    // ========================================================================

    /// Debug dump of the flooding topology (peers by state).
    pub fn flood_topo_dump(&self) {
        let mut by_state: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for peer in self.peers.values() {
            by_state.entry(peer.state.to_string()).or_default().push(&peer.node_name);
        }
        debug!(area = %self.area, peers = ?by_state, "flood topology");
    }

    /// Warns when an adjacency key of a configured peer is close to
    /// expiry. Adjacency keys drive the link-state protocol; one expiring
    /// while its originator is still a live peer means refreshes are not
    /// getting through.
    pub fn audit_key_ttls(&self) -> usize {
        let threshold = (self.config.key_ttl / 2).as_millis() as i64;
        let mut at_risk = 0;
        for (key, value) in &self.kv_store {
            let Some(node) = key.strip_prefix(ADJ_DB_KEY_PREFIX) else { continue };
            if !self.peers.contains_key(node) {
                continue;
            }
            if !value.is_immortal() && value.ttl_ms < threshold {
                warn!(
                    area = %self.area,
                    key = %key,
                    ttl_ms = value.ttl_ms,
                    "adjacency key of live peer near expiry"
                );
                at_risk += 1;
            }
        }
        at_risk
    }
}
