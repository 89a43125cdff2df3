//! Internal message protocol of the per-area event loop.
//!
//! All state mutations for an area happen on its owning task; every public
//! API call and every peer RPC completion is marshalled into an
//! [`AreaRequest`] and answered over a oneshot channel. Read responses are
//! snapshots copied on the event loop — no caller ever holds references
//! into the live maps.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::oneshot;
use trellis_types::{
    AreaSummary, FullSyncRequest, KeyDumpParams, KeySetParams, MergeReason, PeerState, PeersMap,
    Publication, Value,
};

use crate::client::ClientError;

/// A request handled by one area's event loop.
#[derive(Debug)]
pub enum AreaRequest {
    /// Fetch a fixed set of keys.
    GetKeyVals {
        /// Keys to fetch.
        keys: Vec<String>,
        /// Response channel.
        resp: oneshot::Sender<Publication>,
    },
    /// Merge key-values into the store and flood the delta.
    SetKeyVals {
        /// Key-values plus flooding metadata.
        params: KeySetParams,
        /// Per-key rejection reasons; `None` for fire-and-forget floods.
        resp: Option<oneshot::Sender<BTreeMap<String, MergeReason>>>,
    },
    /// Filtered dump of key-values.
    DumpKeys {
        /// Dump filters.
        params: KeyDumpParams,
        /// Response channel.
        resp: oneshot::Sender<Publication>,
    },
    /// Filtered dump with values stripped (hashes only).
    DumpHashes {
        /// Dump filters.
        params: KeyDumpParams,
        /// Response channel.
        resp: oneshot::Sender<Publication>,
    },
    /// Dump all live self-originated key-values.
    DumpSelfOriginated {
        /// Response channel.
        resp: oneshot::Sender<BTreeMap<String, Value>>,
    },
    /// Dump configured peers with their FSM states.
    GetPeers {
        /// Response channel.
        resp: oneshot::Sender<PeersMap>,
    },
    /// Add or update peers; newly added peers start syncing.
    AddPeers {
        /// Peer name to spec.
        peers: PeersMap,
        /// Completion signal.
        resp: oneshot::Sender<()>,
    },
    /// Remove peers, aborting any in-flight sync to them.
    DelPeers {
        /// Peer names to remove.
        peers: Vec<String>,
        /// Completion signal.
        resp: oneshot::Sender<()>,
    },
    /// Query one peer's FSM state.
    PeerStateQuery {
        /// Peer name.
        peer: String,
        /// Response channel.
        resp: oneshot::Sender<Option<PeerState>>,
    },
    /// Area summary for introspection.
    Summary {
        /// Response channel.
        resp: oneshot::Sender<AreaSummary>,
    },
    /// Stat counters snapshot.
    Counters {
        /// Response channel.
        resp: oneshot::Sender<BTreeMap<String, i64>>,
    },

    /// Persist a self-originated key: win over any competing advertisement
    /// and refresh it indefinitely.
    PersistKey {
        /// Key to persist.
        key: String,
        /// Payload bytes.
        value: Vec<u8>,
    },
    /// Set a self-originated key at a specific version (0 = above the
    /// latest known).
    SetKey {
        /// Key to set.
        key: String,
        /// Payload bytes.
        value: Vec<u8>,
        /// Requested version.
        version: i64,
    },
    /// Publish a final value for a self-originated key and stop
    /// refreshing it.
    UnsetKey {
        /// Key to unset.
        key: String,
        /// Final payload bytes.
        value: Vec<u8>,
    },
    /// Stop refreshing a self-originated key without publishing.
    EraseKey {
        /// Key to erase.
        key: String,
    },

    /// Peer-initiated full sync (first leg), served from the local store.
    FullSync {
        /// The initiator's key-hash dump.
        request: FullSyncRequest,
        /// Response channel carrying the delta publication.
        resp: oneshot::Sender<Publication>,
    },

    /// Completion of an outbound full-sync RPC.
    SyncResult {
        /// Peer the sync was issued to.
        peer: String,
        /// RPC outcome.
        result: Result<Publication, ClientError>,
        /// Round-trip time of the RPC.
        rtt: Duration,
    },
    /// Failure of a fire-and-forget peer RPC (flood, finalize,
    /// keep-alive).
    PeerRpcFailed {
        /// Peer the RPC was issued to.
        peer: String,
        /// Transport error.
        error: ClientError,
    },

    /// Stop the event loop.
    Stop,
}
