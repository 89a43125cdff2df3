//! Prefix advertisement state.
//!
//! Maps every prefix to the set of `(node, area)` advertisements for it.
//! The SpfSolver consumes this to select best routes; updates return the
//! set of changed prefixes so the engine can rebuild incrementally.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use trellis_types::{IpPrefix, PrefixDatabase, PrefixEntry};

/// Advertising identity: `(node, area)`.
pub type NodeAndArea = (String, String);

/// Prefix to advertisement-set mapping across all areas.
#[derive(Debug, Default)]
pub struct PrefixState {
    prefixes: BTreeMap<IpPrefix, BTreeMap<NodeAndArea, PrefixEntry>>,
    /// Reverse index for withdrawal by originator.
    advertised: BTreeMap<NodeAndArea, BTreeSet<IpPrefix>>,
}

impl PrefixState {
    /// Creates an empty prefix state.
    pub fn new() -> Self {
        Self::default()
    }

    /// All prefixes with their advertisements.
    pub fn prefixes(&self) -> &BTreeMap<IpPrefix, BTreeMap<NodeAndArea, PrefixEntry>> {
        &self.prefixes
    }

    /// Applies a node's prefix database for one area.
    ///
    /// Returns the prefixes whose advertisement set changed (added,
    /// updated, or withdrawn).
    pub fn update_prefix_database(&mut self, db: PrefixDatabase) -> BTreeSet<IpPrefix> {
        let node_area: NodeAndArea = (db.this_node_name.clone(), db.area.clone());
        if db.delete_prefix {
            return self.delete_prefix_database(&db.this_node_name, &db.area);
        }

        let mut changed = BTreeSet::new();
        let mut still_advertised = BTreeSet::new();
        for entry in db.prefix_entries {
            let prefix = entry.prefix;
            still_advertised.insert(prefix);
            let advertisements = self.prefixes.entry(prefix).or_default();
            let replaced = advertisements.insert(node_area.clone(), entry);
            if replaced.as_ref() != advertisements.get(&node_area) {
                changed.insert(prefix);
            }
        }

        // Withdraw prefixes this originator no longer advertises.
        let previously = self.advertised.get(&node_area).cloned().unwrap_or_default();
        for prefix in previously.difference(&still_advertised) {
            if let Some(advertisements) = self.prefixes.get_mut(prefix) {
                advertisements.remove(&node_area);
                if advertisements.is_empty() {
                    self.prefixes.remove(prefix);
                }
                changed.insert(*prefix);
            }
        }

        debug!(
            node = %node_area.0,
            area = %node_area.1,
            advertised = still_advertised.len(),
            changed = changed.len(),
            "prefix database updated"
        );
        self.advertised.insert(node_area, still_advertised);
        changed
    }

    /// Withdraws everything one node advertised into one area.
    pub fn delete_prefix_database(&mut self, node: &str, area: &str) -> BTreeSet<IpPrefix> {
        let node_area: NodeAndArea = (node.to_string(), area.to_string());
        let mut changed = BTreeSet::new();
        if let Some(prefixes) = self.advertised.remove(&node_area) {
            for prefix in prefixes {
                if let Some(advertisements) = self.prefixes.get_mut(&prefix) {
                    advertisements.remove(&node_area);
                    if advertisements.is_empty() {
                        self.prefixes.remove(&prefix);
                    }
                    changed.insert(prefix);
                }
            }
        }
        changed
    }
}
