//! Initialization events emitted to observers.
//!
//! During node bring-up the store reports its progress so that downstream
//! modules (Decision, the FIB programmer) can hold off until the local
//! view has converged with the area's peers.

use std::time::Duration;

/// Warn when initial sync has not completed within this window.
pub const KVSTORE_SYNCED_WARNING: Duration = Duration::from_millis(150_000);

/// Give up and report a sync error after this window.
pub const KVSTORE_SYNCED_TIMEOUT: Duration = Duration::from_millis(300_000);

/// Progress of the store through node initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializationEvent {
    /// The store has started and is waiting for peers.
    Initializing,
    /// At least one peer has been configured.
    PeersDiscovered,
    /// Every area finished its initial sync: each area either has no
    /// peers, reached INITIALIZED with all of them, or exhausted its
    /// attempts.
    KvStoreSynced,
    /// Initial sync did not complete within [`KVSTORE_SYNCED_TIMEOUT`].
    KvStoreSyncError,
}
