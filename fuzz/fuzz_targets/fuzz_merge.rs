//! Fuzz target for the key-value merge procedure.
//!
//! Feeds arbitrary decoded publications through `merge_key_values` and
//! checks its core invariants: no panic on any input, the local store only
//! ever moves up in the value order, and merging the same batch twice is a
//! no-op the second time.

#![no_main]

use std::collections::BTreeMap;

use libfuzzer_sys::fuzz_target;

use trellis_kvstore::merge_key_values;
use trellis_types::codec::decode;
use trellis_types::{Value, compare_values};

fuzz_target!(|data: &[u8]| {
    let Ok(batches) = decode::<Vec<BTreeMap<String, Value>>>(data) else {
        return;
    };

    let mut local: BTreeMap<String, Value> = BTreeMap::new();
    for batch in batches {
        let before = local.clone();
        merge_key_values(&mut local, batch.clone(), None, "fuzz-node");

        // The winner for a key never regresses.
        for (key, old_value) in &before {
            let new_value = local.get(key).expect("merge never removes keys");
            if let Some(order) = compare_values(new_value, old_value) {
                assert_ne!(order, std::cmp::Ordering::Less, "merge regressed key {key}");
            }
        }

        // Re-merging the identical batch must accept nothing new.
        let replay = merge_key_values(&mut local, batch, None, "fuzz-node");
        assert!(replay.updates.is_empty(), "merge not idempotent");
    }
});
