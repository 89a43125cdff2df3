//! Three-way full sync integration tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{AREA, connect, spawn_node, test_config};
use trellis_kvstore::{InitializationEvent, LoopbackClientFactory};
use trellis_test_utils::assert_eventually_async;
use trellis_types::{KeySetParams, PeerState, TTL_INFINITY, Value};

fn immortal(version: i64, originator: &str, payload: &str) -> Value {
    Value::new(version, originator, Some(payload.as_bytes().to_vec()), TTL_INFINITY, 1)
}

async fn set_one(handle: &trellis_kvstore::KvStoreHandle, key: &str, value: Value) {
    let reasons = handle
        .set_key_vals(
            AREA,
            KeySetParams {
                key_vals: BTreeMap::from([(key.to_string(), value)]),
                sender_id: None,
                node_ids: Vec::new(),
            },
        )
        .await
        .expect("set_key_vals");
    assert!(reasons.is_empty(), "unexpected merge rejections: {reasons:?}");
}

async fn has_key(handle: &trellis_kvstore::KvStoreHandle, key: &str) -> bool {
    handle
        .get_key_vals(AREA, vec![key.to_string()])
        .await
        .map(|publication| publication.key_vals.contains_key(key))
        .unwrap_or(false)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_node_full_sync() {
    let factory = Arc::new(LoopbackClientFactory::new());
    let n1 = spawn_node(test_config("node1"), &factory);
    let n2 = spawn_node(test_config("node2"), &factory);

    set_one(&n1.handle, "k1", immortal(1, "node1", "v1")).await;
    set_one(&n2.handle, "k2", immortal(1, "node2", "v2")).await;

    connect(&n1, &n2).await;

    // Both stores converge on the union of keys.
    assert!(
        assert_eventually_async(Duration::from_secs(5), || async {
            has_key(&n1.handle, "k2").await && has_key(&n2.handle, "k1").await
        })
        .await,
        "stores did not converge"
    );

    // Both peers reach INITIALIZED.
    assert!(
        assert_eventually_async(Duration::from_secs(5), || async {
            let s1 = n1.handle.peer_state(AREA, "node2").await.unwrap();
            let s2 = n2.handle.peer_state(AREA, "node1").await.unwrap();
            s1 == Some(PeerState::Initialized) && s2 == Some(PeerState::Initialized)
        })
        .await,
        "peers did not initialize"
    );

    // And both nodes report KVSTORE_SYNCED.
    for node in [&n1, &n2] {
        let events = node.handle.initialization_events();
        assert!(
            assert_eventually_async(Duration::from_secs(5), || async {
                *events.borrow() == InitializationEvent::KvStoreSynced
            })
            .await,
            "kvstore synced event missing"
        );
    }

    n1.store.stop().await;
    n2.store.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_peers_syncs_immediately() {
    let factory = Arc::new(LoopbackClientFactory::new());
    let n1 = spawn_node(test_config("node1"), &factory);

    // An empty peer report completes initial sync for the area.
    n1.handle.add_peers(AREA, Default::default()).await.unwrap();

    let events = n1.handle.initialization_events();
    assert!(
        assert_eventually_async(Duration::from_secs(5), || async {
            *events.borrow() == InitializationEvent::KvStoreSynced
        })
        .await
    );
    n1.store.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sync_converges_to_max_value() {
    let factory = Arc::new(LoopbackClientFactory::new());
    let n1 = spawn_node(test_config("node1"), &factory);
    let n2 = spawn_node(test_config("node2"), &factory);

    // Same key at different versions on both sides.
    set_one(&n1.handle, "k", immortal(3, "origin", "older")).await;
    set_one(&n2.handle, "k", immortal(7, "origin", "newer")).await;

    connect(&n1, &n2).await;

    assert!(
        assert_eventually_async(Duration::from_secs(5), || async {
            let v1 = n1.handle.get_key_vals(AREA, vec!["k".to_string()]).await.unwrap();
            v1.key_vals.get("k").map(|v| v.version) == Some(7)
        })
        .await,
        "initiator did not converge to the max value"
    );
    // The responder keeps its newer copy.
    let v2 = n2.handle.get_key_vals(AREA, vec!["k".to_string()]).await.unwrap();
    assert_eq!(v2.key_vals["k"].version, 7);
    assert_eq!(v2.key_vals["k"].value.as_deref(), Some(b"newer".as_slice()));

    n1.store.stop().await;
    n2.store.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_peer_reports_sync_error() {
    let factory = Arc::new(LoopbackClientFactory::new());
    let n1 = spawn_node(test_config("node1"), &factory);

    // Peer that is not registered anywhere: every client build fails.
    n1.handle
        .add_peers(
            AREA,
            trellis_types::PeersMap::from([(
                "ghost".to_string(),
                trellis_types::PeerSpec::default(),
            )]),
        )
        .await
        .unwrap();

    let events = n1.handle.initialization_events();
    assert!(
        assert_eventually_async(Duration::from_secs(5), || async {
            *events.borrow() == InitializationEvent::KvStoreSyncError
        })
        .await,
        "sync error event missing"
    );
    n1.store.stop().await;
}
