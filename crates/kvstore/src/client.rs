//! Peer transport capability.
//!
//! The store is parameterized over the client type so it can run against
//! the real RPC transport or embedded in-process. [`PeerClient`] is the
//! capability every peer connection provides; [`StoreClient`] is the
//! in-process implementation that talks straight to another store's area
//! event loop, used for embedded deployments and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};
use trellis_types::{FullSyncRequest, KeySetParams, PeerSpec, Publication};

use crate::api::AreaRequest;

/// Transport-level errors talking to a peer.
#[derive(Debug, Clone, Snafu)]
pub enum ClientError {
    /// The peer is unreachable or the connection dropped.
    #[snafu(display("transport error talking to {peer}: {message}"))]
    Transport {
        /// Peer name.
        peer: String,
        /// Failure description.
        message: String,
    },

    /// No transport client could be built for the peer.
    #[snafu(display("cannot build client for {peer}: {message}"))]
    ClientBuild {
        /// Peer name.
        peer: String,
        /// Failure description.
        message: String,
    },
}

/// Capability provided by a connection to one peer store.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// First leg of the three-way full sync: send our key-hash dump,
    /// receive the peer's differing key-values plus the keys it wants
    /// from us.
    async fn full_sync(&self, request: FullSyncRequest) -> Result<Publication, ClientError>;

    /// Third leg of the full sync: push our newer-or-absent values for the
    /// keys the peer asked for.
    async fn finalize_full_sync(&self, params: KeySetParams) -> Result<(), ClientError>;

    /// Incremental flood of a merged delta.
    async fn flood(&self, params: KeySetParams) -> Result<(), ClientError>;

    /// Keep the transport channel from idling out.
    async fn keep_alive(&self) -> Result<(), ClientError>;
}

/// Builds peer clients on demand.
///
/// The store rebuilds a client every time a peer re-enters syncing after a
/// teardown; the factory hides whether that means dialing a socket or
/// looking up an in-process channel.
pub trait PeerClientFactory: Send + Sync {
    /// Creates a client for `peer_name` in `area`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ClientBuild`] when no transport to the peer
    /// can be established.
    fn create(
        &self,
        area: &str,
        peer_name: &str,
        spec: &PeerSpec,
    ) -> Result<Arc<dyn PeerClient>, ClientError>;
}

/// In-process client that feeds another store's area event loop directly.
pub struct StoreClient {
    peer_name: String,
    tx: mpsc::UnboundedSender<AreaRequest>,
}

impl StoreClient {
    /// Creates a client around a remote area's request sender.
    pub fn new(peer_name: impl Into<String>, tx: mpsc::UnboundedSender<AreaRequest>) -> Self {
        Self { peer_name: peer_name.into(), tx }
    }

    fn transport_err(&self, message: impl Into<String>) -> ClientError {
        ClientError::Transport { peer: self.peer_name.clone(), message: message.into() }
    }
}

#[async_trait]
impl PeerClient for StoreClient {
    async fn full_sync(&self, request: FullSyncRequest) -> Result<Publication, ClientError> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(AreaRequest::FullSync { request, resp })
            .map_err(|_| self.transport_err("peer store is gone"))?;
        rx.await.map_err(|_| self.transport_err("peer dropped sync response"))
    }

    async fn finalize_full_sync(&self, params: KeySetParams) -> Result<(), ClientError> {
        self.tx
            .send(AreaRequest::SetKeyVals { params, resp: None })
            .map_err(|_| self.transport_err("peer store is gone"))
    }

    async fn flood(&self, params: KeySetParams) -> Result<(), ClientError> {
        self.tx
            .send(AreaRequest::SetKeyVals { params, resp: None })
            .map_err(|_| self.transport_err("peer store is gone"))
    }

    async fn keep_alive(&self) -> Result<(), ClientError> {
        if self.tx.is_closed() {
            return Err(self.transport_err("peer store is gone"));
        }
        Ok(())
    }
}

/// Registry-backed factory wiring stores together in one process.
///
/// Each store registers its per-area request senders under its node name;
/// peers then resolve clients by `(node, area)`.
#[derive(Default, Clone)]
pub struct LoopbackClientFactory {
    registry: Arc<RwLock<HashMap<(String, String), mpsc::UnboundedSender<AreaRequest>>>>,
}

impl LoopbackClientFactory {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a store's area request sender under its node name.
    pub fn register(
        &self,
        node_name: impl Into<String>,
        area: impl Into<String>,
        tx: mpsc::UnboundedSender<AreaRequest>,
    ) {
        self.registry.write().insert((node_name.into(), area.into()), tx);
    }

    /// Removes a registered store (e.g. on shutdown).
    pub fn deregister(&self, node_name: &str, area: &str) {
        self.registry.write().remove(&(node_name.to_string(), area.to_string()));
    }
}

impl PeerClientFactory for LoopbackClientFactory {
    fn create(
        &self,
        area: &str,
        peer_name: &str,
        _spec: &PeerSpec,
    ) -> Result<Arc<dyn PeerClient>, ClientError> {
        let registry = self.registry.read();
        let tx = registry.get(&(peer_name.to_string(), area.to_string())).ok_or_else(|| {
            ClientError::ClientBuild {
                peer: peer_name.to_string(),
                message: format!("no loopback registration for area {area:?}"),
            }
        })?;
        Ok(Arc::new(StoreClient::new(peer_name, tx.clone())))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_factory_resolves_registered_peer() {
        let factory = LoopbackClientFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        factory.register("peer1", "area0", tx);

        assert!(factory.create("area0", "peer1", &PeerSpec::default()).is_ok());
        assert!(factory.create("area0", "peer2", &PeerSpec::default()).is_err());
        assert!(factory.create("area1", "peer1", &PeerSpec::default()).is_err());
    }

    #[tokio::test]
    async fn test_store_client_surfaces_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let client = StoreClient::new("peer1", tx);

        let err = client.full_sync(FullSyncRequest::default()).await.unwrap_err();
        assert!(matches!(err, ClientError::Transport { .. }));
        assert!(client.keep_alive().await.is_err());
    }
}
