//! Per-area event loop.
//!
//! Each area's [`KvStoreDb`] is owned by exactly one task; every public
//! API call, peer RPC completion, and timer fires on this loop, so state
//! never needs a lock. Outbound peer RPCs are the only suspension points:
//! they run as spawned sub-tasks whose completions are marshalled back
//! into the loop as [`AreaRequest`] messages.

use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use trellis_types::Publication;

use crate::api::AreaRequest;
use crate::db::{
    FLOOD_TOPO_DUMP_INTERVAL, KEEP_ALIVE_INTERVAL, KEY_TTL_AUDIT_INTERVAL, KvStoreDb, MergeResult,
    PeerCommand, SELF_ADVERTISE_THROTTLE,
};

/// Idle sleep when no timer is armed.
const IDLE_TICK: Duration = Duration::from_secs(3600);

/// Signal sent to the store when an area concludes its initial sync;
/// `true` means every peer initialized, `false` means completion with
/// errors.
pub type SyncStatus = (String, bool);

/// The event loop driving one area's database.
pub struct AreaTask {
    db: KvStoreDb,
    rx: mpsc::UnboundedReceiver<AreaRequest>,
    self_tx: mpsc::UnboundedSender<AreaRequest>,
    publications_tx: broadcast::Sender<Publication>,
    sync_status_tx: mpsc::UnboundedSender<SyncStatus>,
    stop_rx: broadcast::Receiver<()>,
    advertise_at: Option<Instant>,
    keep_alive_at: Instant,
    flood_topo_at: Instant,
    ttl_audit_at: Instant,
}

impl AreaTask {
    /// Creates the task shell around a database.
    pub fn new(
        db: KvStoreDb,
        rx: mpsc::UnboundedReceiver<AreaRequest>,
        self_tx: mpsc::UnboundedSender<AreaRequest>,
        publications_tx: broadcast::Sender<Publication>,
        sync_status_tx: mpsc::UnboundedSender<SyncStatus>,
        stop_rx: broadcast::Receiver<()>,
    ) -> Self {
        let now = Instant::now();
        Self {
            db,
            rx,
            self_tx,
            publications_tx,
            sync_status_tx,
            stop_rx,
            advertise_at: None,
            keep_alive_at: now + KEEP_ALIVE_INTERVAL,
            flood_topo_at: now + FLOOD_TOPO_DUMP_INTERVAL,
            ttl_audit_at: now + KEY_TTL_AUDIT_INTERVAL,
        }
    }

    /// Runs the loop until a stop signal or the request channel closes.
    pub async fn run(mut self) {
        debug!(area = %self.db.area(), "area event loop started");
        loop {
            let now = Instant::now();
            self.fire_due_timers(now);

            let deadline = self.next_deadline(now).unwrap_or(now + IDLE_TICK);
            tokio::select! {
                _ = self.stop_rx.recv() => break,
                request = self.rx.recv() => match request {
                    None | Some(AreaRequest::Stop) => break,
                    Some(request) => self.handle_request(request),
                },
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
            }
        }
        debug!(area = %self.db.area(), "area event loop stopped");
    }

    fn next_deadline(&self, now: Instant) -> Option<Instant> {
        [
            self.db.next_ttl_deadline(),
            self.db.next_flood_drain(now),
            self.db.next_ttl_refresh(),
            self.db.next_sync_deadline(now),
            self.advertise_at,
            Some(self.keep_alive_at),
            Some(self.flood_topo_at),
            Some(self.ttl_audit_at),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn fire_due_timers(&mut self, now: Instant) {
        if self.db.next_ttl_deadline().is_some_and(|at| at <= now) {
            if let Some(publication) = self.db.expire_keys(now) {
                self.publish(publication);
            }
        }

        if self.db.next_flood_drain(now).is_some_and(|at| at <= now) {
            let commands = self.db.drain_flood_buffer();
            self.dispatch(commands);
        }

        if self.advertise_at.is_some_and(|at| at <= now) {
            self.advertise_at = None;
            let result = self.db.advertise_self_originated_keys(now);
            self.finish_merge(result);
        }

        if self.db.next_ttl_refresh().is_some_and(|at| at <= now) {
            let result = self.db.advertise_ttl_updates(now);
            self.finish_merge(result);
        }

        if self.db.next_sync_deadline(now).is_some_and(|at| at <= now) {
            self.run_sync_pass();
        }

        if self.keep_alive_at <= now {
            self.keep_alive_at = now + KEEP_ALIVE_INTERVAL;
            let commands = self.db.keep_alive_commands();
            self.dispatch(commands);
        }

        if self.flood_topo_at <= now {
            self.flood_topo_at = now + FLOOD_TOPO_DUMP_INTERVAL;
            self.db.flood_topo_dump();
        }

        if self.ttl_audit_at <= now {
            self.ttl_audit_at = now + KEY_TTL_AUDIT_INTERVAL;
            self.db.audit_key_ttls();
        }
    }

    fn handle_request(&mut self, request: AreaRequest) {
        let now = Instant::now();
        match request {
            AreaRequest::GetKeyVals { keys, resp } => {
                let _ = resp.send(self.db.get_key_vals(&keys));
            }
            AreaRequest::SetKeyVals { params, resp } => {
                let result = self.db.set_key_vals(params, now);
                let reasons = result.no_merge_reasons.clone();
                self.finish_merge(result);
                if let Some(resp) = resp {
                    let _ = resp.send(reasons);
                }
            }
            AreaRequest::DumpKeys { params, resp } => {
                let _ = resp.send(self.db.dump_keys(&params));
            }
            AreaRequest::DumpHashes { params, resp } => {
                let _ = resp.send(self.db.dump_hashes(&params));
            }
            AreaRequest::DumpSelfOriginated { resp } => {
                let _ = resp.send(self.db.dump_self_originated());
            }
            AreaRequest::GetPeers { resp } => {
                let _ = resp.send(self.db.dump_peers());
            }
            AreaRequest::AddPeers { peers, resp } => {
                self.db.add_peers(peers);
                // A peer report, even an empty one, can conclude initial
                // sync (the no-peers case).
                self.run_sync_pass();
                let _ = resp.send(());
            }
            AreaRequest::DelPeers { peers, resp } => {
                self.db.del_peers(&peers);
                if let Some(success) = self.db.check_initial_sync_at_startup() {
                    self.report_sync_status(success);
                }
                let _ = resp.send(());
            }
            AreaRequest::PeerStateQuery { peer, resp } => {
                let _ = resp.send(self.db.peer_state(&peer));
            }
            AreaRequest::Summary { resp } => {
                let _ = resp.send(self.db.summary());
            }
            AreaRequest::Counters { resp } => {
                let _ = resp.send(self.db.counters());
            }
            AreaRequest::PersistKey { key, value } => {
                self.db.persist_self_originated_key(key, value, now);
                self.schedule_advertisement(now);
            }
            AreaRequest::SetKey { key, value, version } => {
                self.db.set_self_originated_key(key, value, version, now);
                self.schedule_advertisement(now);
            }
            AreaRequest::UnsetKey { key, value } => {
                self.db.unset_self_originated_key(key, value);
                self.schedule_advertisement(now);
            }
            AreaRequest::EraseKey { key } => {
                self.db.erase_self_originated_key(&key);
            }
            AreaRequest::FullSync { request, resp } => {
                let _ = resp.send(self.db.process_full_sync(&request));
            }
            AreaRequest::SyncResult { peer, result, rtt } => match result {
                Ok(response) => {
                    let outcome = self.db.process_sync_success(&peer, response, rtt, now);
                    self.finish_merge(outcome.merge);
                    self.dispatch(outcome.commands);
                    if let Some(success) = outcome.initial_sync_done {
                        self.report_sync_status(success);
                    }
                    // The parallel limit doubled; promote more idle peers.
                    self.run_sync_pass();
                }
                Err(error) => {
                    warn!(area = %self.db.area(), peer = %peer, %error, "full sync failed");
                    if let Some(success) = self.db.process_sync_failure(&peer) {
                        self.report_sync_status(success);
                    }
                }
            },
            AreaRequest::PeerRpcFailed { peer, error } => {
                warn!(area = %self.db.area(), peer = %peer, %error, "peer rpc failed");
                if let Some(success) = self.db.process_sync_failure(&peer) {
                    self.report_sync_status(success);
                }
            }
            AreaRequest::Stop => {}
        }
    }

    /// Publishes a merge delta to subscribers, dispatches its floods, and
    /// tears down an inconsistent sender for re-sync. A merge can also
    /// queue self-originated re-advertisements (previous-incarnation
    /// case), so the throttle is armed here too.
    fn finish_merge(&mut self, result: MergeResult) {
        if let Some(sender) = &result.inconsistent_sender {
            self.db.process_inconsistency(sender);
        }
        self.dispatch(result.commands);
        self.publish(result.delta);
        self.schedule_advertisement(Instant::now());
    }

    fn publish(&self, publication: Publication) {
        if publication.is_empty() {
            return;
        }
        // Send fails only when no subscriber is listening, which is fine.
        let _ = self.publications_tx.send(publication);
    }

    /// Promotes idle peers into syncing and checks whether the pass
    /// concluded initial sync (covers peers whose client cannot even be
    /// built).
    fn run_sync_pass(&mut self) {
        let commands = self.db.request_peer_syncs();
        self.dispatch(commands);
        if let Some(success) = self.db.check_initial_sync_at_startup() {
            self.report_sync_status(success);
        }
    }

    fn schedule_advertisement(&mut self, now: Instant) {
        if self.db.has_pending_advertisements() && self.advertise_at.is_none() {
            self.advertise_at = Some(now + SELF_ADVERTISE_THROTTLE);
        }
    }

    fn report_sync_status(&self, success: bool) {
        let _ = self.sync_status_tx.send((self.db.area().to_string(), success));
    }

    fn dispatch(&self, commands: Vec<PeerCommand>) {
        for command in commands {
            let self_tx = self.self_tx.clone();
            match command {
                PeerCommand::FullSync { peer, client, request } => {
                    tokio::spawn(async move {
                        let start = Instant::now();
                        let result = client.full_sync(request).await;
                        let _ = self_tx.send(AreaRequest::SyncResult {
                            peer,
                            result,
                            rtt: start.elapsed(),
                        });
                    });
                }
                PeerCommand::FinalizeFullSync { peer, client, params } => {
                    tokio::spawn(async move {
                        if let Err(error) = client.finalize_full_sync(params).await {
                            let _ = self_tx.send(AreaRequest::PeerRpcFailed { peer, error });
                        }
                    });
                }
                PeerCommand::Flood { peer, client, params } => {
                    tokio::spawn(async move {
                        if let Err(error) = client.flood(params).await {
                            let _ = self_tx.send(AreaRequest::PeerRpcFailed { peer, error });
                        }
                    });
                }
                PeerCommand::KeepAlive { peer, client } => {
                    tokio::spawn(async move {
                        if let Err(error) = client.keep_alive().await {
                            let _ = self_tx.send(AreaRequest::PeerRpcFailed { peer, error });
                        }
                    });
                }
            }
        }
    }
}
