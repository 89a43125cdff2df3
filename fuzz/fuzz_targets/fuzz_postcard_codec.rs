//! Fuzz target for postcard codec roundtrip.
//!
//! Tests that arbitrary bytes fed to `postcard::from_bytes` for wire
//! types never panic, and that successfully decoded values roundtrip
//! correctly.

#![no_main]

use libfuzzer_sys::fuzz_target;

use trellis_types::codec::{decode, encode};
use trellis_types::{
    AdjacencyDatabase, FullSyncRequest, KeyDumpParams, KeySetParams, PrefixDatabase, Publication,
    Value,
};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    let selector = data[0] % 7;
    let payload = &data[1..];

    match selector {
        0 => try_roundtrip::<Value>(payload),
        1 => try_roundtrip::<Publication>(payload),
        2 => try_roundtrip::<KeySetParams>(payload),
        3 => try_roundtrip::<KeyDumpParams>(payload),
        4 => try_roundtrip::<FullSyncRequest>(payload),
        5 => try_roundtrip::<AdjacencyDatabase>(payload),
        _ => try_roundtrip::<PrefixDatabase>(payload),
    }
});

/// Attempt to decode arbitrary bytes as type T. If successful, re-encode
/// and verify the roundtrip produces the same value.
fn try_roundtrip<T>(data: &[u8])
where
    T: serde::Serialize + serde::de::DeserializeOwned + PartialEq + std::fmt::Debug,
{
    if let Ok(value) = decode::<T>(data) {
        // If decoding succeeds, encoding must also succeed.
        let re_encoded = encode(&value);
        assert!(re_encoded.is_ok(), "encode failed after successful decode");

        // Re-decoding the re-encoded bytes must produce the same value.
        let re_decoded = decode::<T>(&re_encoded.expect("already checked"));
        assert!(re_decoded.is_ok(), "re-decode failed after successful encode");
        assert_eq!(value, re_decoded.expect("already checked"), "roundtrip mismatch");
    }
    // Decode failure is expected for arbitrary bytes — no panic is the invariant.
}
