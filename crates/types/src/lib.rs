//! Core type definitions for the Trellis routing platform.
//!
//! This crate holds the data model shared by the KvStore gossip substrate
//! and the Decision engine:
//!
//! - Versioned key-value types ([`Value`], [`Publication`], dump filters)
//! - Routing model ([`Adjacency`], [`PrefixEntry`], RIB entries)
//! - Postcard wire codec ([`codec`])
//! - Value content hashing ([`hash`])
//! - Validated configuration ([`config`])
//! - The [`MetricSink`] capability for stat emission

#![deny(unsafe_code)]

pub mod codec;
pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod net;
pub mod types;

pub use error::{KvStoreError, Result};
pub use metrics::{FacadeMetrics, MetricSink, NoopMetrics};
pub use net::{
    Adjacency, AdjacencyDatabase, ForwardingAlgorithm, ForwardingType, IpPrefix, MplsAction,
    NextHop, PrefixDatabase, PrefixEntry, PrefixMetrics, RibMplsEntry, RibUnicastEntry,
    RouteUpdate, adjacency_db_key, is_mpls_label_valid, parse_adjacency_db_key,
    parse_prefix_db_key, prefix_db_key,
};
pub use types::{
    AreaSummary, FilterOperator, FullSyncRequest, KeyDumpParams, KeyGetParams, KeySetParams,
    KvStoreFilters, MergeReason, PeerSpec, PeerState, PeersMap, Publication, TTL_INFINITY, Value,
    compare_values,
};

/// Node identifier, unique within a routing domain.
pub type NodeId = String;

/// Area identifier; every KvStore database and LinkState graph is per-area.
pub type AreaId = String;
