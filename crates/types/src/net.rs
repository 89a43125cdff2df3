//! Routing data model: adjacencies, prefixes, next hops, and RIB entries.
//!
//! Adjacency and prefix databases are carried as KvStore values under
//! well-known keys (`adj:<node>`, `prefix:<node>`) and consumed by the
//! Decision engine; RIB entries are what the engine emits toward the FIB
//! programmer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Key prefix for adjacency databases in the KvStore.
pub const ADJ_DB_KEY_PREFIX: &str = "adj:";

/// Key prefix for prefix databases in the KvStore.
pub const PREFIX_DB_KEY_PREFIX: &str = "prefix:";

/// Lowest non-reserved MPLS label.
pub const MPLS_LABEL_MIN: i32 = 16;

/// Highest encodable MPLS label (20 bits).
pub const MPLS_LABEL_MAX: i32 = (1 << 20) - 1;

/// Default adjacency weight for UCMP when none is advertised.
pub const DEFAULT_ADJ_WEIGHT: i64 = 64;

/// Returns the KvStore key carrying `node`'s adjacency database.
pub fn adjacency_db_key(node: &str) -> String {
    format!("{ADJ_DB_KEY_PREFIX}{node}")
}

/// Returns the KvStore key carrying `node`'s prefix database.
pub fn prefix_db_key(node: &str) -> String {
    format!("{PREFIX_DB_KEY_PREFIX}{node}")
}

/// Extracts the node name from an adjacency database key.
pub fn parse_adjacency_db_key(key: &str) -> Option<&str> {
    key.strip_prefix(ADJ_DB_KEY_PREFIX)
}

/// Extracts the node name from a prefix database key.
pub fn parse_prefix_db_key(key: &str) -> Option<&str> {
    key.strip_prefix(PREFIX_DB_KEY_PREFIX)
}

/// Returns true if `label` is inside the non-reserved MPLS label space.
pub fn is_mpls_label_valid(label: i32) -> bool {
    (MPLS_LABEL_MIN..=MPLS_LABEL_MAX).contains(&label)
}

/// A directed adjacency advertised by a node toward one neighbor.
///
/// A bidirectional link materializes in LinkState only once both endpoints
/// advertise mutually consistent adjacencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct Adjacency {
    /// Neighbor's node name.
    #[builder(into)]
    pub other_node_name: String,
    /// Local interface this adjacency runs over.
    #[builder(into)]
    pub if_name: String,
    /// Neighbor's interface on the far end.
    #[builder(into)]
    pub other_if_name: String,
    /// Directed link metric from this node toward the neighbor.
    #[builder(default = 1)]
    pub metric: u64,
    /// Overload bit for this adjacency direction.
    #[builder(default)]
    pub is_overloaded: bool,
    /// Adjacency segment label, 0 when segment routing is off.
    #[builder(default)]
    pub adj_label: i32,
    /// IPv4 next hop toward the neighbor over this interface.
    #[builder(default = Ipv4Addr::UNSPECIFIED)]
    pub next_hop_v4: Ipv4Addr,
    /// IPv6 next hop toward the neighbor over this interface.
    #[builder(default = Ipv6Addr::UNSPECIFIED)]
    pub next_hop_v6: Ipv6Addr,
    /// UCMP weight for this adjacency direction.
    #[builder(default = DEFAULT_ADJ_WEIGHT)]
    pub weight: i64,
}

/// A node's full set of adjacencies within one area.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct AdjacencyDatabase {
    /// Advertising node.
    #[builder(into)]
    pub this_node_name: String,
    /// Area the database belongs to.
    #[builder(into, default)]
    pub area: String,
    /// All adjacencies advertised by the node.
    #[builder(default)]
    pub adjacencies: Vec<Adjacency>,
    /// Hard-drain bit: the node accepts terminating but no transit traffic.
    #[builder(default)]
    pub is_overloaded: bool,
    /// Node segment label, 0 when segment routing is off.
    #[builder(default)]
    pub node_label: i32,
    /// Soft-drain metric increment advertised by the node.
    #[builder(default)]
    pub node_metric_increment_val: u64,
}

/// An IP prefix (address plus mask length).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IpPrefix {
    /// Network address.
    pub addr: IpAddr,
    /// Mask length in bits.
    pub prefix_len: u8,
}

impl IpPrefix {
    /// Creates a prefix from an address and mask length.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    /// Returns true for IPv4 prefixes.
    pub fn is_v4(&self) -> bool {
        self.addr.is_ipv4()
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s.split_once('/').ok_or_else(|| format!("missing '/' in {s:?}"))?;
        let addr: IpAddr = addr.parse().map_err(|e| format!("bad address in {s:?}: {e}"))?;
        let prefix_len: u8 = len.parse().map_err(|e| format!("bad mask length in {s:?}: {e}"))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return Err(format!("mask length {prefix_len} out of range for {addr}"));
        }
        Ok(Self { addr, prefix_len })
    }
}

/// How traffic toward a prefix is forwarded.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ForwardingType {
    /// Plain IP forwarding.
    #[default]
    Ip,
    /// Segment-routed MPLS forwarding.
    SrMpls,
}

/// Path computation algorithm for a prefix.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ForwardingAlgorithm {
    /// Shortest path, equal-cost multipath.
    #[default]
    SpEcmp,
    /// Shortest path with UCMP weights propagated from adjacency weights.
    SpUcmpAdjWeightPropagation,
    /// Shortest path with UCMP weights propagated from prefix weights.
    SpUcmpPrefixWeightPropagation,
    /// Two edge-disjoint shortest paths (requires SR-MPLS).
    Ksp2EdEcmp,
}

/// Comparable route preference metrics carried on a prefix advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct PrefixMetrics {
    /// Higher wins. Distinguishes path classes (e.g. primary vs backup).
    #[builder(default = 1000)]
    pub path_preference: i32,
    /// Higher wins. Distinguishes advertisement sources.
    #[builder(default = 100)]
    pub source_preference: i32,
    /// Lower wins. Accumulated distance of re-advertisement hops.
    #[builder(default)]
    pub distance: i32,
    /// Set to 1 when the advertising path traverses a drained node, so the
    /// drain signal survives re-advertisement across areas.
    #[builder(default)]
    pub drain_metric: i64,
}

impl Default for PrefixMetrics {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A single prefix advertisement from one originator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct PrefixEntry {
    /// Advertised prefix.
    pub prefix: IpPrefix,
    /// Forwarding type required by the originator.
    #[builder(default)]
    pub forwarding_type: ForwardingType,
    /// Path computation algorithm requested by the originator.
    #[builder(default)]
    pub forwarding_algorithm: ForwardingAlgorithm,
    /// Free-form route tags.
    #[builder(default)]
    pub tags: BTreeSet<String>,
    /// Preference metrics for best-route selection.
    #[builder(default)]
    pub metrics: PrefixMetrics,
    /// Minimum number of next hops required to program the route.
    pub min_nexthop: Option<u64>,
    /// Label to prepend for prefixes redistributed from label domains.
    pub prepend_label: Option<i32>,
    /// UCMP prefix weight.
    pub weight: Option<i64>,
}

/// A node's full set of prefix advertisements within one area.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct PrefixDatabase {
    /// Advertising node.
    #[builder(into)]
    pub this_node_name: String,
    /// Area the database belongs to.
    #[builder(into, default)]
    pub area: String,
    /// All prefix advertisements from the node.
    #[builder(default)]
    pub prefix_entries: Vec<PrefixEntry>,
    /// Tombstone: the node withdraws all its prefixes.
    #[builder(default)]
    pub delete_prefix: bool,
}

/// MPLS operation attached to a next hop.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MplsAction {
    /// Penultimate hop pop: forward with the top label removed.
    Php,
    /// Swap the top label.
    Swap(i32),
    /// Pop and route by the inner header; used by the label's owner.
    PopAndLookup,
    /// Push a label stack (topmost last).
    Push(Vec<i32>),
}

/// A resolved next hop emitted into the RIB.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, bon::Builder)]
pub struct NextHop {
    /// Next-hop address.
    pub address: IpAddr,
    /// Outgoing interface.
    #[builder(into)]
    pub if_name: String,
    /// Metric of the path through this next hop.
    #[builder(default)]
    pub metric: u64,
    /// UCMP weight; 0 means plain ECMP.
    #[builder(default)]
    pub weight: i64,
    /// Area the next hop was computed in.
    #[builder(into, default)]
    pub area: String,
    /// Neighbor on the far side of the interface.
    #[builder(into, default)]
    pub neighbor_node_name: String,
    /// Optional MPLS operation.
    pub mpls_action: Option<MplsAction>,
}

/// A unicast route selected for a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RibUnicastEntry {
    /// Destination prefix.
    pub prefix: IpPrefix,
    /// Selected next hops.
    pub nexthops: BTreeSet<NextHop>,
    /// The winning advertisement.
    pub best_prefix_entry: PrefixEntry,
    /// Area of the winning advertisement.
    pub best_area: String,
    /// IGP metric to the closest advertising node.
    pub shortest_metric: u64,
    /// True when the winning node is hard- or soft-drained.
    pub is_best_node_drained: bool,
}

/// An MPLS label route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RibMplsEntry {
    /// Incoming label.
    pub label: i32,
    /// Next hops with their label operations.
    pub nexthops: BTreeSet<NextHop>,
}

impl RibMplsEntry {
    /// Creates a label route.
    pub fn new(label: i32, nexthops: impl IntoIterator<Item = NextHop>) -> Self {
        Self { label, nexthops: nexthops.into_iter().collect() }
    }
}

/// Minimal delta between two successive route databases, consumed by the
/// FIB programmer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteUpdate {
    /// Unicast routes to add or replace.
    pub unicast_to_update: BTreeMap<IpPrefix, RibUnicastEntry>,
    /// Unicast routes to withdraw.
    pub unicast_to_delete: Vec<IpPrefix>,
    /// Label routes to add or replace.
    pub mpls_to_update: BTreeMap<i32, RibMplsEntry>,
    /// Label routes to withdraw.
    pub mpls_to_delete: Vec<i32>,
}

impl RouteUpdate {
    /// True when the delta carries no changes.
    pub fn is_empty(&self) -> bool {
        self.unicast_to_update.is_empty()
            && self.unicast_to_delete.is_empty()
            && self.mpls_to_update.is_empty()
            && self.mpls_to_delete.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_prefix_parse_display() {
        let p: IpPrefix = "10.1.0.0/16".parse().unwrap();
        assert!(p.is_v4());
        assert_eq!(p.to_string(), "10.1.0.0/16");

        let p6: IpPrefix = "fc00::/7".parse().unwrap();
        assert!(!p6.is_v4());
        assert_eq!(p6.prefix_len, 7);
    }

    #[test]
    fn test_ip_prefix_parse_rejects_bad_input() {
        assert!("10.0.0.0".parse::<IpPrefix>().is_err());
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("not-an-addr/8".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_mpls_label_validity() {
        assert!(!is_mpls_label_valid(0));
        assert!(!is_mpls_label_valid(15));
        assert!(is_mpls_label_valid(16));
        assert!(is_mpls_label_valid(MPLS_LABEL_MAX));
        assert!(!is_mpls_label_valid(MPLS_LABEL_MAX + 1));
    }

    #[test]
    fn test_db_key_roundtrip() {
        assert_eq!(parse_adjacency_db_key(&adjacency_db_key("node1")), Some("node1"));
        assert_eq!(parse_prefix_db_key(&prefix_db_key("node1")), Some("node1"));
        assert_eq!(parse_adjacency_db_key("prefix:node1"), None);
    }
}
