//! Local copies of the `trellis-test-utils` helpers used by this crate's
//! own unit tests.
//!
//! `trellis-test-utils` depends on `trellis-decision` (to build
//! [`LinkState`] graphs for other crates' tests), so this crate cannot
//! dev-depend on `trellis-test-utils` without creating a dependency
//! cycle back to itself, which makes `cargo test` build two
//! incompatible copies of `trellis-decision`. These helpers are kept in
//! sync with their `trellis-test-utils` counterparts but live here so
//! this crate's unit tests have no such cycle.

use std::collections::HashMap;

use trellis_types::codec;
use trellis_types::{Adjacency, AdjacencyDatabase, PrefixDatabase, PrefixEntry, Value};

use crate::link_state::LinkState;

pub(crate) fn create_adjacency(
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

pub(crate) fn create_adj_db(node: &str, adjacencies: Vec<Adjacency>, node_label: i32) -> AdjacencyDatabase {
    AdjacencyDatabase::builder()
        .this_node_name(node)
        .area("area0")
        .adjacencies(adjacencies)
        .node_label(node_label)
        .build()
}

pub(crate) fn link_state_from_topology(topology: &[(u64, &[(u64, u64)])]) -> LinkState {
    link_state_with_labels(topology, &[])
}

pub(crate) fn link_state_with_labels(
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

pub(crate) fn adjacency_db_value(db: &AdjacencyDatabase, version: i64) -> Value {
    Value::new(
        version,
        db.this_node_name.clone(),
        Some(codec::encode(db).expect("encode adjacency db")),
        trellis_types::TTL_INFINITY,
        1,
    )
}

pub(crate) fn prefix_db_value(node: &str, entries: Vec<PrefixEntry>, version: i64) -> Value {
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
