//! Route database and diffing.
//!
//! Each route computation produces a full `RouteDb`; diffing successive
//! databases yields the minimal [`RouteUpdate`] handed to the FIB
//! programmer.

use std::collections::BTreeMap;

use trellis_types::{IpPrefix, RibMplsEntry, RibUnicastEntry, RouteUpdate};

/// The computed routes of one node: unicast plus MPLS label routes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteDb {
    /// Unicast routes by prefix.
    pub unicast_routes: BTreeMap<IpPrefix, RibUnicastEntry>,
    /// Label routes by incoming label.
    pub mpls_routes: BTreeMap<i32, RibMplsEntry>,
}

impl RouteDb {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a unicast route.
    pub fn add_unicast_route(&mut self, entry: RibUnicastEntry) {
        self.unicast_routes.insert(entry.prefix, entry);
    }

    /// Adds or replaces a label route.
    pub fn add_mpls_route(&mut self, entry: RibMplsEntry) {
        self.mpls_routes.insert(entry.label, entry);
    }

    /// Computes the delta from `self` to `new_db`: per route family, keys
    /// only in `new_db` or with changed values go to update, keys only in
    /// `self` go to delete.
    pub fn calculate_update(&self, new_db: &RouteDb) -> RouteUpdate {
        let mut delta = RouteUpdate::default();

        for (prefix, entry) in &new_db.unicast_routes {
            if self.unicast_routes.get(prefix) != Some(entry) {
                delta.unicast_to_update.insert(*prefix, entry.clone());
            }
        }
        for prefix in self.unicast_routes.keys() {
            if !new_db.unicast_routes.contains_key(prefix) {
                delta.unicast_to_delete.push(*prefix);
            }
        }

        for (label, entry) in &new_db.mpls_routes {
            if self.mpls_routes.get(label) != Some(entry) {
                delta.mpls_to_update.insert(*label, entry.clone());
            }
        }
        for label in self.mpls_routes.keys() {
            if !new_db.mpls_routes.contains_key(label) {
                delta.mpls_to_delete.push(*label);
            }
        }

        delta
    }

    /// Applies a delta in place.
    pub fn apply_update(&mut self, update: &RouteUpdate) {
        for prefix in &update.unicast_to_delete {
            self.unicast_routes.remove(prefix);
        }
        for (prefix, entry) in &update.unicast_to_update {
            self.unicast_routes.insert(*prefix, entry.clone());
        }
        for label in &update.mpls_to_delete {
            self.mpls_routes.remove(label);
        }
        for (label, entry) in &update.mpls_to_update {
            self.mpls_routes.insert(*label, entry.clone());
        }
    }
}
