//! Top-level KvStore: one database per area behind a shared API.
//!
//! `KvStore` owns the per-area event-loop tasks plus a monitor that
//! aggregates their initial-sync signals into node-level initialization
//! events. `KvStoreHandle` is the cheap, clonable API surface; every call
//! marshals into the owning area's loop and waits for its snapshot reply.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use trellis_types::config::{ConfigError, KvStoreConfig};
use trellis_types::error::{KvStoreError, Result};
use trellis_types::metrics::SharedMetricSink;
use trellis_types::{
    AreaSummary, KeyDumpParams, KeySetParams, MergeReason, PeerState, PeersMap, Publication, Value,
};

use crate::api::AreaRequest;
use crate::area::{AreaTask, SyncStatus};
use crate::client::{LoopbackClientFactory, PeerClientFactory};
use crate::db::KvStoreDb;
use crate::events::{InitializationEvent, KVSTORE_SYNCED_TIMEOUT, KVSTORE_SYNCED_WARNING};

/// Capacity of the subscriber publication channel.
const PUBLICATION_CHANNEL_CAPACITY: usize = 1024;

/// Clonable API handle to a running store.
#[derive(Clone)]
pub struct KvStoreHandle {
    node_name: String,
    areas: Arc<BTreeMap<String, mpsc::UnboundedSender<AreaRequest>>>,
    publications_tx: broadcast::Sender<Publication>,
    init_tx: Arc<watch::Sender<InitializationEvent>>,
}

/// A running store: per-area event loops plus the initialization monitor.
pub struct KvStore {
    handle: KvStoreHandle,
    stop_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl KvStore {
    /// Validates the config and spawns one event loop per area.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configuration is invalid.
    pub fn spawn(
        config: KvStoreConfig,
        areas: impl IntoIterator<Item = String>,
        client_factory: Arc<dyn PeerClientFactory>,
        metrics: SharedMetricSink,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let (publications_tx, _) = broadcast::channel(PUBLICATION_CHANNEL_CAPACITY);
        let (stop_tx, _) = broadcast::channel(1);
        let (init_tx, _) = watch::channel(InitializationEvent::Initializing);
        let init_tx = Arc::new(init_tx);
        let (sync_status_tx, sync_status_rx) = mpsc::unbounded_channel();

        let mut area_txs = BTreeMap::new();
        let mut tasks = Vec::new();
        for area in areas {
            let (tx, rx) = mpsc::unbounded_channel();
            let db = KvStoreDb::new(
                area.clone(),
                Arc::clone(&config),
                Arc::clone(&client_factory),
                Arc::clone(&metrics),
            );
            let task = AreaTask::new(
                db,
                rx,
                tx.clone(),
                publications_tx.clone(),
                sync_status_tx.clone(),
                stop_tx.subscribe(),
            );
            tasks.push(tokio::spawn(task.run()));
            area_txs.insert(area, tx);
        }

        tasks.push(tokio::spawn(Self::monitor_initial_sync(
            area_txs.len(),
            sync_status_rx,
            Arc::clone(&init_tx),
            stop_tx.subscribe(),
        )));

        info!(node = %config.node_name, areas = area_txs.len(), "kvstore started");
        let handle = KvStoreHandle {
            node_name: config.node_name.clone(),
            areas: Arc::new(area_txs),
            publications_tx,
            init_tx,
        };
        Ok(Self { handle, stop_tx, tasks })
    }

    /// Returns the API handle.
    pub fn handle(&self) -> KvStoreHandle {
        self.handle.clone()
    }

    /// Registers every area's request channel with a loopback factory so
    /// other in-process stores can peer with this one.
    pub fn register_loopback(&self, factory: &LoopbackClientFactory) {
        for (area, tx) in self.handle.areas.iter() {
            factory.register(self.handle.node_name.clone(), area.clone(), tx.clone());
        }
    }

    /// Stops all event loops and waits for them to exit.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }
    }

    /// Aggregates per-area initial-sync signals into node-level
    /// initialization events, with warning and timeout thresholds.
    async fn monitor_initial_sync(
        area_count: usize,
        mut sync_status_rx: mpsc::UnboundedReceiver<SyncStatus>,
        init_tx: Arc<watch::Sender<InitializationEvent>>,
        mut stop_rx: broadcast::Receiver<()>,
    ) {
        let started = tokio::time::Instant::now();
        let warning_at = started + KVSTORE_SYNCED_WARNING;
        let timeout_at = started + KVSTORE_SYNCED_TIMEOUT;
        let mut warned = false;
        let mut results: BTreeMap<String, bool> = BTreeMap::new();

        loop {
            tokio::select! {
                _ = stop_rx.recv() => return,
                _ = tokio::time::sleep_until(warning_at), if !warned => {
                    warned = true;
                    warn!(
                        synced_areas = results.len(),
                        total_areas = area_count,
                        "initial kvstore sync still incomplete"
                    );
                }
                _ = tokio::time::sleep_until(timeout_at) => {
                    warn!("initial kvstore sync timed out");
                    let _ = init_tx.send(InitializationEvent::KvStoreSyncError);
                    return;
                }
                status = sync_status_rx.recv() => {
                    let Some((area, success)) = status else { return };
                    results.insert(area, success);
                    if results.len() >= area_count {
                        let event = if results.values().all(|s| *s) {
                            info!(elapsed_ms = started.elapsed().as_millis() as u64, "kvstore synced");
                            InitializationEvent::KvStoreSynced
                        } else {
                            warn!("kvstore sync completed with peer errors");
                            InitializationEvent::KvStoreSyncError
                        };
                        let _ = init_tx.send(event);
                        return;
                    }
                }
            }
        }
    }
}

impl KvStoreHandle {
    /// Name of the local node.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Configured area ids.
    pub fn areas(&self) -> Vec<String> {
        self.areas.keys().cloned().collect()
    }

    /// Raw request sender for an area, for embedded peering.
    pub fn area_sender(&self, area: &str) -> Option<mpsc::UnboundedSender<AreaRequest>> {
        self.areas.get(area).cloned()
    }

    fn area_tx(
        &self,
        area: &str,
        caller: &'static str,
    ) -> Result<&mpsc::UnboundedSender<AreaRequest>> {
        self.areas
            .get(area)
            .ok_or_else(|| KvStoreError::UnknownArea { area: area.to_string(), caller })
    }

    async fn request<T>(
        &self,
        area: &str,
        caller: &'static str,
        build: impl FnOnce(oneshot::Sender<T>) -> AreaRequest,
    ) -> Result<T> {
        let tx = self.area_tx(area, caller)?;
        let (resp, rx) = oneshot::channel();
        tx.send(build(resp)).map_err(|_| KvStoreError::ShuttingDown)?;
        rx.await.map_err(|_| KvStoreError::ShuttingDown)
    }

    /// Fetches a fixed set of keys from one area.
    pub async fn get_key_vals(&self, area: &str, keys: Vec<String>) -> Result<Publication> {
        self.request(area, "get_key_vals", |resp| AreaRequest::GetKeyVals { keys, resp }).await
    }

    /// Merges key-values into one area and floods the delta.
    ///
    /// Returns the per-key merge rejection reasons.
    pub async fn set_key_vals(
        &self,
        area: &str,
        params: KeySetParams,
    ) -> Result<BTreeMap<String, MergeReason>> {
        self.request(area, "set_key_vals", |resp| AreaRequest::SetKeyVals {
            params,
            resp: Some(resp),
        })
        .await
    }

    /// Filtered dump of one area.
    pub async fn dump_keys(&self, area: &str, params: KeyDumpParams) -> Result<Publication> {
        self.request(area, "dump_keys", |resp| AreaRequest::DumpKeys { params, resp }).await
    }

    /// Filtered hash dump (values stripped) of one area.
    pub async fn dump_hashes(&self, area: &str, params: KeyDumpParams) -> Result<Publication> {
        self.request(area, "dump_hashes", |resp| AreaRequest::DumpHashes { params, resp }).await
    }

    /// Live self-originated key-values of one area.
    pub async fn dump_self_originated(&self, area: &str) -> Result<BTreeMap<String, Value>> {
        self.request(area, "dump_self_originated", |resp| AreaRequest::DumpSelfOriginated { resp })
            .await
    }

    /// Configured peers of one area, with FSM states.
    pub async fn get_peers(&self, area: &str) -> Result<PeersMap> {
        self.request(area, "get_peers", |resp| AreaRequest::GetPeers { resp }).await
    }

    /// Adds or updates peers in one area.
    ///
    /// An empty map is a valid peer-discovery report: it tells the area
    /// that discovery finished with no peers, which completes its initial
    /// sync immediately.
    pub async fn add_peers(&self, area: &str, peers: PeersMap) -> Result<()> {
        if !peers.is_empty() {
            self.init_tx.send_if_modified(|state| {
                if *state == InitializationEvent::Initializing {
                    *state = InitializationEvent::PeersDiscovered;
                    true
                } else {
                    false
                }
            });
        }
        self.request(area, "add_peers", |resp| AreaRequest::AddPeers { peers, resp }).await
    }

    /// Removes peers from one area.
    pub async fn del_peers(&self, area: &str, peers: Vec<String>) -> Result<()> {
        self.request(area, "del_peers", |resp| AreaRequest::DelPeers { peers, resp }).await
    }

    /// FSM state of one peer.
    pub async fn peer_state(&self, area: &str, peer: &str) -> Result<Option<PeerState>> {
        let peer = peer.to_string();
        self.request(area, "peer_state", |resp| AreaRequest::PeerStateQuery { peer, resp }).await
    }

    /// Summaries of the selected areas (all areas when empty).
    pub async fn area_summaries(&self, select_areas: Vec<String>) -> Result<Vec<AreaSummary>> {
        let areas: Vec<String> =
            if select_areas.is_empty() { self.areas() } else { select_areas };
        let mut summaries = Vec::with_capacity(areas.len());
        for area in areas {
            summaries
                .push(self.request(&area, "area_summaries", |resp| AreaRequest::Summary { resp }).await?);
        }
        Ok(summaries)
    }

    /// Aggregated stat counters, namespaced per area.
    pub async fn counters(&self) -> Result<BTreeMap<String, i64>> {
        let mut all = BTreeMap::new();
        for area in self.areas() {
            let counters =
                self.request(&area, "counters", |resp| AreaRequest::Counters { resp }).await?;
            for (name, value) in counters {
                all.insert(format!("{area}.{name}"), value);
            }
        }
        Ok(all)
    }

    /// Persists a self-originated key in one area.
    pub fn persist_self_originated_key(
        &self,
        area: &str,
        key: String,
        value: Vec<u8>,
    ) -> Result<()> {
        self.area_tx(area, "persist_self_originated_key")?
            .send(AreaRequest::PersistKey { key, value })
            .map_err(|_| KvStoreError::ShuttingDown)
    }

    /// Sets a self-originated key at a specific version (0 = above the
    /// latest known).
    pub fn set_self_originated_key(
        &self,
        area: &str,
        key: String,
        value: Vec<u8>,
        version: i64,
    ) -> Result<()> {
        self.area_tx(area, "set_self_originated_key")?
            .send(AreaRequest::SetKey { key, value, version })
            .map_err(|_| KvStoreError::ShuttingDown)
    }

    /// Publishes a final value for a self-originated key and stops
    /// refreshing it.
    pub fn unset_self_originated_key(&self, area: &str, key: String, value: Vec<u8>) -> Result<()> {
        self.area_tx(area, "unset_self_originated_key")?
            .send(AreaRequest::UnsetKey { key, value })
            .map_err(|_| KvStoreError::ShuttingDown)
    }

    /// Stops refreshing a self-originated key without publishing.
    pub fn erase_self_originated_key(&self, area: &str, key: String) -> Result<()> {
        self.area_tx(area, "erase_self_originated_key")?
            .send(AreaRequest::EraseKey { key })
            .map_err(|_| KvStoreError::ShuttingDown)
    }

    /// Subscribes to the raw publication stream of all areas.
    pub fn subscribe(&self) -> broadcast::Receiver<Publication> {
        self.publications_tx.subscribe()
    }

    /// Subscribes with dump filters applied; `ignore_ttl` additionally
    /// drops pure TTL refreshes (publication entries without payload).
    pub fn subscribe_filtered(&self, params: KeyDumpParams) -> mpsc::UnboundedReceiver<Publication> {
        let mut raw = self.publications_tx.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let mut publication = match raw.recv().await {
                    Ok(publication) => publication,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "subscriber lagged; publications dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                publication.key_vals.retain(|key, value| {
                    if params.ignore_ttl && value.value.is_none() {
                        return false;
                    }
                    filter_matches(&params, key, &value.originator_id)
                });
                if params.do_not_publish_value {
                    for value in publication.key_vals.values_mut() {
                        value.value = None;
                    }
                }
                if !publication.is_empty() && tx.send(publication).is_err() {
                    return;
                }
            }
        });
        rx
    }

    /// Watch channel of node initialization progress.
    pub fn initialization_events(&self) -> watch::Receiver<InitializationEvent> {
        self.init_tx.subscribe()
    }
}

fn filter_matches(params: &KeyDumpParams, key: &str, originator: &str) -> bool {
    let key_match = params.keys.is_empty() || params.keys.iter().any(|p| key.starts_with(p));
    let originator_match =
        params.originator_ids.is_empty() || params.originator_ids.iter().any(|o| o == originator);
    match params.oper {
        trellis_types::FilterOperator::Or => {
            if params.keys.is_empty() {
                originator_match
            } else if params.originator_ids.is_empty() {
                key_match
            } else {
                key_match || originator_match
            }
        }
        trellis_types::FilterOperator::And => key_match && originator_match,
    }
}
