//! Error types for the Trellis platform using snafu.

use snafu::Snafu;

/// Unified result type for store operations.
pub type Result<T, E = KvStoreError> = std::result::Result<T, E>;

/// Errors surfaced to callers of the KvStore public API.
///
/// Merge rejections are not errors; they come back as per-key
/// [`MergeReason`](crate::types::MergeReason) values.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum KvStoreError {
    /// The requested area is not configured on this node.
    #[snafu(display("unknown area {area:?} requested by {caller}"))]
    UnknownArea {
        /// The area that was requested.
        area: String,
        /// The API entry point that made the request.
        caller: &'static str,
    },

    /// The store is shutting down and no longer serves requests.
    #[snafu(display("store is shutting down"))]
    ShuttingDown,

    /// An internal invariant was violated while serving the request.
    #[snafu(display("internal error: {message}"))]
    Internal {
        /// Description of the failure.
        message: String,
    },
}
