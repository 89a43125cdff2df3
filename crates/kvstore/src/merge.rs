//! Merge semantics for replicated key-values.
//!
//! The local value for a key is always the maximum, by the total order on
//! `(version, originator_id, value)`, over every value ever merged for that
//! key and not yet expired. A change of only `ttl`/`ttl_version` with the
//! same content is a TTL refresh, not a content change: it updates the TTL
//! fields in place and floods onward with the payload stripped so that
//! subscribers can suppress it (`ignore_ttl`).

use std::cmp::Ordering;
use std::collections::BTreeMap;

use trellis_types::{KvStoreFilters, MergeReason, TTL_INFINITY, Value, compare_values};

/// Result of merging a batch of incoming key-values.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Accepted deltas, keyed by key. Content changes carry the full new
    /// value; TTL refreshes carry the value with the payload stripped.
    pub updates: BTreeMap<String, Value>,
    /// Per-key reasons for keys that were not merged.
    pub no_merge_reasons: BTreeMap<String, MergeReason>,
    /// Keys for which the sender reported an older version of a value this
    /// node originated — the peer holds a stale view of our own key.
    pub stale_reports: Vec<String>,
}

/// Merges `incoming` into `local`, returning the accepted deltas and the
/// per-key rejection reasons.
///
/// `self_originator` is the local node id; it drives stale-report
/// detection for keys this node claims authorship of. Hashes of incoming
/// values are recomputed locally whenever the payload is present; the wire
/// hash only participates in the equality check for payload-stripped TTL
/// refreshes, where a wrong hash can at worst suppress the refresh.
pub fn merge_key_values(
    local: &mut BTreeMap<String, Value>,
    incoming: BTreeMap<String, Value>,
    filters: Option<&KvStoreFilters>,
    self_originator: &str,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();

    for (key, mut in_val) in incoming {
        if let Some(filters) = filters {
            if !filters.matches(&key, &in_val.originator_id) {
                outcome.no_merge_reasons.insert(key, MergeReason::NoMatchedKey);
                continue;
            }
        }

        if in_val.ttl_ms <= 0 && in_val.ttl_ms != TTL_INFINITY {
            outcome.no_merge_reasons.insert(key, MergeReason::InvalidTtl);
            continue;
        }

        if in_val.value.is_some() {
            in_val.update_hash();
        }

        let Some(local_val) = local.get_mut(&key) else {
            if in_val.value.is_some() {
                local.insert(key.clone(), in_val.clone());
                outcome.updates.insert(key, in_val);
            } else {
                // A TTL refresh for a key we never had; nothing to refresh.
                outcome.no_merge_reasons.insert(key, MergeReason::NoNeedToUpdate);
            }
            continue;
        };

        match compare_values(&in_val, local_val) {
            Some(Ordering::Greater) if in_val.value.is_some() => {
                *local_val = in_val.clone();
                outcome.updates.insert(key, in_val);
            }
            Some(Ordering::Equal) if in_val.ttl_version > local_val.ttl_version => {
                // TTL refresh: same content, newer ttl_version.
                local_val.ttl_ms = in_val.ttl_ms;
                local_val.ttl_version = in_val.ttl_version;
                let mut delta = local_val.without_value();
                delta.ttl_ms = in_val.ttl_ms;
                delta.ttl_version = in_val.ttl_version;
                outcome.updates.insert(key, delta);
            }
            Some(Ordering::Less) => {
                if in_val.originator_id == local_val.originator_id
                    && local_val.originator_id == self_originator
                {
                    outcome.stale_reports.push(key.clone());
                }
                outcome.no_merge_reasons.insert(key, MergeReason::OldVersion);
            }
            _ => {
                outcome.no_merge_reasons.insert(key, MergeReason::NoNeedToUpdate);
            }
        }
    }

    outcome
}
