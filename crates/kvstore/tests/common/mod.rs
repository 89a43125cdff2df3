//! Shared harness for in-process multi-store tests.
//!
//! Stores are wired together through the loopback client factory, so a
//! whole gossip mesh runs inside one tokio runtime with no sockets.

use std::sync::Arc;
use std::time::Duration;

use trellis_kvstore::{KvStore, KvStoreHandle, LoopbackClientFactory};
use trellis_types::config::KvStoreConfig;
use trellis_types::{NoopMetrics, PeerSpec, PeersMap};

/// Default area used by the harness.
pub const AREA: &str = "area0";

/// A store plus its API handle.
pub struct TestNode {
    pub store: KvStore,
    pub handle: KvStoreHandle,
}

/// Builds a config with a short self-originated key TTL so refresh paths
/// are exercised quickly.
pub fn test_config(node_name: &str) -> KvStoreConfig {
    KvStoreConfig::builder()
        .node_name(node_name)
        .key_ttl(Duration::from_millis(400))
        .build()
}

/// Spawns a store and registers it with the loopback factory.
pub fn spawn_node(config: KvStoreConfig, factory: &Arc<LoopbackClientFactory>) -> TestNode {
    let store = KvStore::spawn(
        config,
        [AREA.to_string()],
        Arc::clone(factory) as Arc<dyn trellis_kvstore::PeerClientFactory>,
        Arc::new(NoopMetrics),
    )
    .expect("valid test config");
    store.register_loopback(factory);
    let handle = store.handle();
    TestNode { store, handle }
}

/// Makes two nodes peers of each other in the default area.
pub async fn connect(a: &TestNode, b: &TestNode) {
    let peer_of = |name: &str| {
        PeersMap::from([(name.to_string(), PeerSpec { peer_addr: name.to_string(), ..Default::default() })])
    };
    a.handle.add_peers(AREA, peer_of(b.handle.node_name())).await.expect("add peer");
    b.handle.add_peers(AREA, peer_of(a.handle.node_name())).await.expect("add peer");
}
