//! Link-state decision engine.
//!
//! Consumes adjacency and prefix databases carried in the KvStore and
//! computes the route database:
//!
//! - [`LinkState`] — per-area bidirectional-link graph with memoized SPF,
//!   k-shortest-paths, and UCMP weight resolution
//! - [`PrefixState`] — prefix to advertisement-set mapping
//! - [`SpfSolver`] — per-prefix best-route selection, next-hop derivation,
//!   and MPLS label routes
//! - [`RouteDb`] — diffing between successive route computations
//! - [`Decision`] — the event-loop task gluing it all to the KvStore
//!   publication stream

#![deny(unsafe_code)]

pub mod engine;
pub mod link;
pub mod link_state;
pub mod prefix_state;
pub mod route_db;
pub mod spf_solver;
#[cfg(test)]
mod test_support;

pub use engine::Decision;
pub use link::{HoldableValue, Link, LinkId, LinkStateMetric};
pub use link_state::{LinkState, LinkStateChange, Path, SpfNode, SpfResult, UcmpResult};
pub use prefix_state::PrefixState;
pub use route_db::RouteDb;
pub use spf_solver::{RouteSelectionResult, SpfSolver};
