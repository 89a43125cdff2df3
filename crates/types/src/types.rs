//! Key-value store data model.
//!
//! The KvStore replicates opaque byte values keyed by string. Every value
//! carries a version, the identity of its originator, and a TTL; the merge
//! procedure totally orders values by `(version, originator_id, value)` so
//! that every node converges on the same winner for a key regardless of the
//! order publications arrive in.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::value_hash;

/// Sentinel TTL meaning "never expires".
pub const TTL_INFINITY: i64 = i64::MAX;

/// A versioned datum replicated by the KvStore.
///
/// `hash` is a pure function of `(version, originator_id, value)` and is
/// recomputed locally on ingest; the wire hash is only used for delta-dump
/// comparisons, never for merge decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// Monotonically increasing version; 0 is reserved as "uninitialized".
    pub version: i64,
    /// Identity of the node that authored this value.
    pub originator_id: String,
    /// Opaque payload. Absent in hash dumps (`do_not_publish_value`).
    pub value: Option<Vec<u8>>,
    /// Remaining time to live in milliseconds, or [`TTL_INFINITY`].
    pub ttl_ms: i64,
    /// Version of the TTL refresh; bumped on every refresh of an otherwise
    /// unchanged value.
    pub ttl_version: i64,
    /// Content hash over `(version, originator_id, value)`.
    pub hash: Option<i64>,
}

impl Value {
    /// Creates a value with a freshly computed content hash.
    pub fn new(
        version: i64,
        originator_id: impl Into<String>,
        value: Option<Vec<u8>>,
        ttl_ms: i64,
        ttl_version: i64,
    ) -> Self {
        let originator_id = originator_id.into();
        let hash = Some(value_hash(version, &originator_id, value.as_deref()));
        Self { version, originator_id, value, ttl_ms, ttl_version, hash }
    }

    /// Recomputes the content hash from local fields.
    pub fn update_hash(&mut self) {
        self.hash = Some(value_hash(self.version, &self.originator_id, self.value.as_deref()));
    }

    /// Returns true if this value never expires.
    pub fn is_immortal(&self) -> bool {
        self.ttl_ms == TTL_INFINITY
    }

    /// Returns a copy with the payload stripped, for hash dumps.
    pub fn without_value(&self) -> Self {
        Self { value: None, ..self.clone() }
    }
}

/// Compares two values by the lexicographic tuple
/// `(version, originator_id, value)`, all "higher wins".
///
/// Returns `None` when version and originator tie but neither payload is
/// available for comparison and the hashes differ — the caller cannot tell
/// which side is newer from a hash-only dump.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match a.version.cmp(&b.version) {
        Ordering::Equal => {}
        ord => return Some(ord),
    }
    match a.originator_id.cmp(&b.originator_id) {
        Ordering::Equal => {}
        ord => return Some(ord),
    }
    match (&a.value, &b.value) {
        (Some(av), Some(bv)) => Some(av.cmp(bv)),
        _ => {
            // Hash-only comparison: equality is decidable, order is not.
            if a.hash.is_some() && a.hash == b.hash {
                Some(Ordering::Equal)
            } else {
                None
            }
        }
    }
}

/// A batch of merged updates flooded between stores and delivered to
/// subscribers.
///
/// `node_ids` is the accumulated flooding path: every node appends its own
/// id before sending, and never floods back to a peer already on the path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    /// Key-value updates carried by this publication.
    pub key_vals: BTreeMap<String, Value>,
    /// Keys whose TTL expired at the publisher.
    pub expired_keys: Vec<String>,
    /// Flooding path for loop suppression.
    pub node_ids: Vec<String>,
    /// Area this publication belongs to.
    pub area: String,
    /// Third leg of a full sync: keys the responder wants from the
    /// initiator because its own copy hashed differently or was absent.
    pub tobe_updated_keys: Option<Vec<String>>,
}

impl Publication {
    /// Creates an empty publication for an area.
    pub fn new(area: impl Into<String>) -> Self {
        Self { area: area.into(), ..Default::default() }
    }

    /// True if the publication carries neither updates nor expirations.
    pub fn is_empty(&self) -> bool {
        self.key_vals.is_empty() && self.expired_keys.is_empty()
    }
}

/// Parameters for setting key-values into a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySetParams {
    /// Key-values to merge.
    pub key_vals: BTreeMap<String, Value>,
    /// Identity of the sending peer, when the set originates from
    /// flooding rather than a local API call.
    pub sender_id: Option<String>,
    /// Flooding path accumulated so far.
    pub node_ids: Vec<String>,
}

/// Parameters for fetching a fixed set of keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGetParams {
    /// Keys to fetch.
    pub keys: Vec<String>,
}

/// How the key-prefix and originator filter classes combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    /// Match if either filter class matches.
    #[default]
    Or,
    /// Match only if both filter classes match.
    And,
}

/// Parameters for filtered dumps and subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDumpParams {
    /// Key prefixes to match; empty matches everything.
    pub keys: Vec<String>,
    /// Originator ids to match; empty matches everything.
    pub originator_ids: Vec<String>,
    /// Combination of the two filter classes.
    pub oper: FilterOperator,
    /// Suppress pure TTL updates from subscription streams.
    pub ignore_ttl: bool,
    /// Strip `value` bytes from the response.
    pub do_not_publish_value: bool,
    /// Delta-dump semantics: return only keys whose hash differs from the
    /// provided map.
    pub key_val_hashes: Option<BTreeMap<String, i64>>,
}

/// Configured store-level filters for leaf nodes.
///
/// A leaf node only accepts keys matching its configured prefixes or
/// originators, shrinking the replicated set on low-memory devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvStoreFilters {
    /// Accepted key prefixes.
    pub key_prefixes: Vec<String>,
    /// Accepted originator ids.
    pub originator_ids: BTreeSet<String>,
    /// Combination of the two filter classes.
    pub oper: FilterOperator,
}

impl KvStoreFilters {
    /// Creates filters from config lists.
    pub fn new(
        key_prefixes: Vec<String>,
        originator_ids: impl IntoIterator<Item = String>,
        oper: FilterOperator,
    ) -> Self {
        Self { key_prefixes, originator_ids: originator_ids.into_iter().collect(), oper }
    }

    /// Returns true when `key`/`originator` pass the configured filters.
    pub fn matches(&self, key: &str, originator: &str) -> bool {
        let key_match =
            self.key_prefixes.is_empty() || self.key_prefixes.iter().any(|p| key.starts_with(p));
        let originator_match =
            self.originator_ids.is_empty() || self.originator_ids.contains(originator);
        match self.oper {
            FilterOperator::Or => {
                // An empty class matches everything, which would make OR
                // degenerate; require the configured class instead.
                if self.key_prefixes.is_empty() {
                    originator_match
                } else if self.originator_ids.is_empty() {
                    key_match
                } else {
                    key_match || originator_match
                }
            }
            FilterOperator::And => key_match && originator_match,
        }
    }
}

/// Reason a key was not merged. These are outcomes, not errors: the caller
/// of `set_key_vals` receives them per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeReason {
    /// Key rejected by the configured store filters.
    NoMatchedKey,
    /// TTL was non-positive and not the infinity sentinel.
    InvalidTtl,
    /// Incoming value is older than the local one.
    OldVersion,
    /// Incoming value is identical and its TTL version is not newer.
    NoNeedToUpdate,
    /// Publication arrived over a flooding loop.
    LoopDetected,
}

impl fmt::Display for MergeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoMatchedKey => "NO_MATCHED_KEY",
            Self::InvalidTtl => "INVALID_TTL",
            Self::OldVersion => "OLD_VERSION",
            Self::NoNeedToUpdate => "NO_NEED_TO_UPDATE",
            Self::LoopDetected => "LOOP_DETECTED",
        };
        f.write_str(s)
    }
}

/// Transport endpoint of a peer store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    /// Address the peer's control service listens on.
    pub peer_addr: String,
    /// Control port.
    pub ctrl_port: u16,
    /// Current FSM state, populated in dumps.
    pub state: Option<PeerState>,
}

/// Peer finite state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    /// Known but not yet syncing; sync is scheduled or backing off.
    Idle,
    /// Full-sync request in flight.
    Syncing,
    /// Fully synchronized; receives incremental floods.
    Initialized,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Syncing => "SYNCING",
            Self::Initialized => "INITIALIZED",
        };
        f.write_str(s)
    }
}

/// Map of peer name to its spec and state.
pub type PeersMap = BTreeMap<String, PeerSpec>;

/// Summary of one area's store, for operator introspection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaSummary {
    /// Area id.
    pub area: String,
    /// Number of live key-values.
    pub key_vals_count: usize,
    /// Approximate byte size of keys plus payloads.
    pub key_vals_bytes: usize,
    /// Number of configured peers.
    pub peers_count: usize,
}

/// First leg of the three-way full sync: the initiator's key-hash dump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullSyncRequest {
    /// Area to sync.
    pub area: String,
    /// Identity of the initiating node.
    pub sender_id: String,
    /// Hash of every key the initiator holds.
    pub key_val_hashes: BTreeMap<String, i64>,
}
