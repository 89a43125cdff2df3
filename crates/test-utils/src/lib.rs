//! Shared test utilities for Trellis crates.
//!
//! This crate provides common test helpers to reduce boilerplate across
//! test modules:
//!
//! - Adjacency and prefix database builders
//! - Topology-map construction of [`LinkState`] graphs
//! - Encoded KvStore values carrying control-plane databases
//! - Random key-value generation
//! - [`assert_eventually`] — poll a condition until true or timeout

#![deny(unsafe_code)]
// Test utilities are allowed to take shortcuts production code may not.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use trellis_decision::LinkState;
use trellis_types::codec;
use trellis_types::{Adjacency, AdjacencyDatabase, PrefixDatabase, PrefixEntry, Value};

/// Default polling interval for [`assert_eventually`].
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Builds an adjacency with sane defaults for tests.
pub fn create_adjacency(
    other_node: &str,
    if_name: &str,
    other_if_name: &str,
    metric: u64,
) -> Adjacency {
    Adjacency::builder()
        .other_node_name(other_node)
        .if_name(if_name)
        .other_if_name(other_if_name)
        .metric(metric)
        .next_hop_v4("10.0.0.1".parse().unwrap())
        .next_hop_v6("fe80::1".parse().unwrap())
        .build()
}

/// Builds an adjacency database for `node` in the default test area.
pub fn create_adj_db(node: &str, adjacencies: Vec<Adjacency>, node_label: i32) -> AdjacencyDatabase {
    AdjacencyDatabase::builder()
        .this_node_name(node)
        .area("area0")
        .adjacencies(adjacencies)
        .node_label(node_label)
        .build()
}

/// Builds a [`LinkState`] from a topology map.
///
/// Every entry is `(node, [(neighbor, metric), ...])`; parallel links are
/// expressed by repeating a neighbor. Interface names follow the
/// `<node>/<neighbor>/<index>` convention so both sides pair up, and both
/// endpoints must list each other for a link to materialize.
pub fn link_state_from_topology(topology: &[(u64, &[(u64, u64)])]) -> LinkState {
    link_state_with_labels(topology, &[])
}

/// Same as [`link_state_from_topology`], with explicit node segment
/// labels.
pub fn link_state_with_labels(
    topology: &[(u64, &[(u64, u64)])],
    node_labels: &[(u64, i32)],
) -> LinkState {
    let labels: HashMap<u64, i32> = node_labels.iter().copied().collect();
    let mut state = LinkState::new("area0");
    for (node, neighbors) in topology {
        let mut parallel_index: HashMap<u64, usize> = HashMap::new();
        let adjacencies = neighbors
            .iter()
            .map(|(neighbor, metric)| {
                let index = parallel_index.entry(*neighbor).or_insert(0);
                let adj = create_adjacency(
                    &neighbor.to_string(),
                    &format!("{node}/{neighbor}/{index}"),
                    &format!("{neighbor}/{node}/{index}"),
                    *metric,
                );
                *index += 1;
                adj
            })
            .collect();
        state.update_adjacency_database(create_adj_db(
            &node.to_string(),
            adjacencies,
            labels.get(node).copied().unwrap_or(0),
        ));
    }
    state
}

/// Encodes an adjacency database as a KvStore value.
pub fn adjacency_db_value(db: &AdjacencyDatabase, version: i64) -> Value {
    Value::new(
        version,
        db.this_node_name.clone(),
        Some(codec::encode(db).expect("encode adjacency db")),
        trellis_types::TTL_INFINITY,
        1,
    )
}

/// Encodes a prefix database as a KvStore value.
pub fn prefix_db_value(node: &str, entries: Vec<PrefixEntry>, version: i64) -> Value {
    let db = PrefixDatabase::builder()
        .this_node_name(node)
        .area("area0")
        .prefix_entries(entries)
        .build();
    Value::new(
        version,
        node,
        Some(codec::encode(&db).expect("encode prefix db")),
        trellis_types::TTL_INFINITY,
        1,
    )
}

/// Generates a random alphanumeric string of the given length.
pub fn gen_random_str(len: usize) -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}

/// Generates a random key-value pair with the given version and
/// originator.
pub fn gen_random_key_val(
    key_len: usize,
    val_len: usize,
    version: i64,
    originator: &str,
) -> (String, Value) {
    let key = gen_random_str(key_len);
    let value = Value::new(
        version,
        originator,
        Some(gen_random_str(val_len).into_bytes()),
        trellis_types::TTL_INFINITY,
        1,
    );
    (key, value)
}

/// Polls a condition until it returns true or the timeout expires.
///
/// Avoids flaky fixed sleeps in async tests where exact timing is
/// non-deterministic.
///
/// Returns `true` if the condition became true before the timeout.
pub async fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
    }
    condition()
}

/// Async-predicate variant of [`assert_eventually`].
pub async fn assert_eventually_async<F, Fut>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
    }
    condition().await
}
