//! Bidirectional links and holdable attribute values.
//!
//! A link materializes only when both endpoints advertise mutually
//! consistent adjacencies. Links are owned by an arena inside
//! [`LinkState`](crate::LinkState) and referenced everywhere by
//! [`LinkId`]; collections store ids, never the links themselves, which
//! sidesteps the shared ownership between both endpoints' per-node sets
//! and the global set.

use std::net::{Ipv4Addr, Ipv6Addr};

use trellis_types::Adjacency;

/// Metric type used by the link-state graph.
pub type LinkStateMetric = u64;

/// Stable identity of a link within one area's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(pub(crate) u64);

/// Identity key of a link: the ordered pair of `(node, interface)`
/// endpoints. Two links are the same link iff their keys are equal.
pub type LinkKey = ((String, String), (String, String));

/// A value that can delay propagation of "bad news".
///
/// When an update would bring the link state down (overload set, metric
/// raised), the old value is held for `hold_ttl` decrements before the new
/// one becomes visible. The mechanism is currently dormant — production
/// paths pass zero hold TTLs — but the plumbing and semantics are kept.
#[derive(Debug, Clone)]
pub struct HoldableValue<T> {
    val: T,
    held_val: Option<T>,
    hold_ttl: LinkStateMetric,
}

/// Types usable inside [`HoldableValue`]: they know which direction of
/// change is "bringing up" (good news, propagated immediately).
pub trait Holdable: Copy + PartialEq {
    /// True when changing from `old` to `new` improves the state.
    fn is_bringing_up(old: Self, new: Self) -> bool;
}

impl Holdable for bool {
    fn is_bringing_up(old: Self, new: Self) -> bool {
        // Overload clearing is the bring-up direction.
        old && !new
    }
}

impl Holdable for LinkStateMetric {
    fn is_bringing_up(old: Self, new: Self) -> bool {
        new < old
    }
}

impl<T: Holdable> HoldableValue<T> {
    /// Creates a holdable value with no active hold.
    pub fn new(val: T) -> Self {
        Self { val, held_val: None, hold_ttl: 0 }
    }

    /// The externally visible value (the held one while a hold is active).
    pub fn value(&self) -> T {
        self.held_val.unwrap_or(self.val)
    }

    /// True while a hold is active.
    pub fn has_hold(&self) -> bool {
        self.held_val.is_some()
    }

    /// Counts down an active hold; returns true when it just expired.
    pub fn decrement_ttl(&mut self) -> bool {
        if self.held_val.is_some() {
            self.hold_ttl -= 1;
            if self.hold_ttl == 0 {
                self.held_val = None;
                return true;
            }
        }
        false
    }

    /// Updates the value, holding the old one for the appropriate TTL when
    /// the change is bringing state up.
    ///
    /// Returns true when the externally visible value changed immediately.
    pub fn update_value(
        &mut self,
        val: T,
        hold_up_ttl: LinkStateMetric,
        hold_down_ttl: LinkStateMetric,
    ) -> bool {
        if val == self.val {
            return false;
        }
        if self.has_hold() {
            // A second change within the hold falls back to a fast update;
            // stacking holds can extend transient loops instead of
            // shortening them.
            self.held_val = None;
            self.hold_ttl = 0;
        } else {
            self.hold_ttl =
                if T::is_bringing_up(self.val, val) { hold_up_ttl } else { hold_down_ttl };
            if self.hold_ttl != 0 {
                self.held_val = Some(self.val);
            }
        }
        self.val = val;
        !self.has_hold()
    }
}

/// A materialized bidirectional link with per-direction attributes.
///
/// Directional accessors take the node name whose perspective is wanted;
/// passing a node that is not an endpoint is a logic error and panics.
#[derive(Debug, Clone)]
pub struct Link {
    area: String,
    n1: String,
    n2: String,
    if1: String,
    if2: String,
    metric1: LinkStateMetric,
    metric2: LinkStateMetric,
    overload1: bool,
    overload2: bool,
    adj_label1: i32,
    adj_label2: i32,
    nh_v4_1: Ipv4Addr,
    nh_v4_2: Ipv4Addr,
    nh_v6_1: Ipv6Addr,
    nh_v6_2: Ipv6Addr,
    weight1: i64,
    weight2: i64,
    hold_up_ttl: LinkStateMetric,
}

impl Link {
    /// Builds a link from the two matching adjacency advertisements.
    pub fn new(
        area: impl Into<String>,
        node1: impl Into<String>,
        adj1: &Adjacency,
        node2: impl Into<String>,
        adj2: &Adjacency,
    ) -> Self {
        Self {
            area: area.into(),
            n1: node1.into(),
            n2: node2.into(),
            if1: adj1.if_name.clone(),
            if2: adj2.if_name.clone(),
            metric1: adj1.metric,
            metric2: adj2.metric,
            overload1: adj1.is_overloaded,
            overload2: adj2.is_overloaded,
            adj_label1: adj1.adj_label,
            adj_label2: adj2.adj_label,
            nh_v4_1: adj1.next_hop_v4,
            nh_v4_2: adj2.next_hop_v4,
            nh_v6_1: adj1.next_hop_v6,
            nh_v6_2: adj2.next_hop_v6,
            weight1: adj1.weight,
            weight2: adj2.weight,
            hold_up_ttl: 0,
        }
    }

    /// Identity key: the ordered `(node, interface)` endpoint pair.
    pub fn key(&self) -> LinkKey {
        let a = (self.n1.clone(), self.if1.clone());
        let b = (self.n2.clone(), self.if2.clone());
        if a <= b { (a, b) } else { (b, a) }
    }

    /// Area the link belongs to.
    pub fn area(&self) -> &str {
        &self.area
    }

    /// The endpoint opposite `node`.
    pub fn other_node(&self, node: &str) -> &str {
        if self.n1 == node {
            &self.n2
        } else if self.n2 == node {
            &self.n1
        } else {
            panic!("node {node} is not an endpoint of {self}")
        }
    }

    fn directional<T: Copy>(&self, node: &str, v1: T, v2: T) -> T {
        if self.n1 == node {
            v1
        } else if self.n2 == node {
            v2
        } else {
            panic!("node {node} is not an endpoint of {self}")
        }
    }

    /// Local interface at `node`.
    pub fn iface_from_node(&self, node: &str) -> &str {
        self.directional(node, &self.if1, &self.if2)
    }

    /// Directed metric advertised by `node`.
    pub fn metric_from_node(&self, node: &str) -> LinkStateMetric {
        self.directional(node, self.metric1, self.metric2)
    }

    /// Adjacency label advertised by `node`.
    pub fn adj_label_from_node(&self, node: &str) -> i32 {
        self.directional(node, self.adj_label1, self.adj_label2)
    }

    /// UCMP weight advertised by `node`.
    pub fn weight_from_node(&self, node: &str) -> i64 {
        self.directional(node, self.weight1, self.weight2)
    }

    /// Overload bit advertised by `node`.
    pub fn overload_from_node(&self, node: &str) -> bool {
        self.directional(node, self.overload1, self.overload2)
    }

    /// IPv4 next hop from `node` toward the other endpoint.
    pub fn nh_v4_from_node(&self, node: &str) -> Ipv4Addr {
        self.directional(node, self.nh_v4_1, self.nh_v4_2)
    }

    /// IPv6 next hop from `node` toward the other endpoint.
    pub fn nh_v6_from_node(&self, node: &str) -> Ipv6Addr {
        self.directional(node, self.nh_v6_1, self.nh_v6_2)
    }

    fn directional_mut<T>(
        &mut self,
        node: &str,
        pick1: impl FnOnce(&mut Self) -> &mut T,
        pick2: impl FnOnce(&mut Self) -> &mut T,
    ) -> &mut T {
        if self.n1 == node {
            pick1(self)
        } else if self.n2 == node {
            pick2(self)
        } else {
            panic!("node {node} is not an endpoint of a link")
        }
    }

    /// Sets the directed metric advertised by `node`; returns true (a
    /// metric change always changes topology cost).
    pub fn set_metric_from_node(&mut self, node: &str, metric: LinkStateMetric) -> bool {
        *self.directional_mut(node, |l| &mut l.metric1, |l| &mut l.metric2) = metric;
        true
    }

    /// Sets the overload bit advertised by `node`; returns true when the
    /// link's up/down state changed.
    pub fn set_overload_from_node(&mut self, node: &str, overload: bool) -> bool {
        let was_up = self.is_up();
        *self.directional_mut(node, |l| &mut l.overload1, |l| &mut l.overload2) = overload;
        was_up != self.is_up()
    }

    /// Sets the adjacency label advertised by `node`.
    pub fn set_adj_label_from_node(&mut self, node: &str, label: i32) {
        *self.directional_mut(node, |l| &mut l.adj_label1, |l| &mut l.adj_label2) = label;
    }

    /// Sets the UCMP weight advertised by `node`.
    pub fn set_weight_from_node(&mut self, node: &str, weight: i64) {
        *self.directional_mut(node, |l| &mut l.weight1, |l| &mut l.weight2) = weight;
    }

    /// Sets the IPv4 next hop advertised by `node`.
    pub fn set_nh_v4_from_node(&mut self, node: &str, nh: Ipv4Addr) {
        *self.directional_mut(node, |l| &mut l.nh_v4_1, |l| &mut l.nh_v4_2) = nh;
    }

    /// Sets the IPv6 next hop advertised by `node`.
    pub fn set_nh_v6_from_node(&mut self, node: &str, nh: Ipv6Addr) {
        *self.directional_mut(node, |l| &mut l.nh_v6_1, |l| &mut l.nh_v6_2) = nh;
    }

    /// Arms a bring-up hold on this link.
    pub fn set_hold_up_ttl(&mut self, ttl: LinkStateMetric) {
        self.hold_up_ttl = ttl;
    }

    /// Usable for forwarding: no pending hold and neither side overloaded.
    pub fn is_up(&self) -> bool {
        self.hold_up_ttl == 0 && !self.overload1 && !self.overload2
    }

    /// Counts down an armed hold; returns true when it just expired.
    pub fn decrement_holds(&mut self) -> bool {
        if self.hold_up_ttl != 0 {
            self.hold_up_ttl -= 1;
            return self.hold_up_ttl == 0;
        }
        false
    }

    /// True while a hold is armed.
    pub fn has_holds(&self) -> bool {
        self.hold_up_ttl != 0
    }
}

impl std::fmt::Display for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}%{} <---> {}%{}", self.area, self.n1, self.if1, self.n2, self.if2)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn adj(other: &str, if_name: &str, other_if: &str, metric: u64, label: i32) -> Adjacency {
        Adjacency::builder()
            .other_node_name(other)
            .if_name(if_name)
            .other_if_name(other_if)
            .metric(metric)
            .adj_label(label)
            .build()
    }

    #[test]
    fn test_link_directional_accessors() {
        let adj1 = adj("node2", "if1", "if2", 1, 100);
        let adj2 = adj("node1", "if2", "if1", 2, 200);
        let link = Link::new("area0", "node1", &adj1, "node2", &adj2);

        assert_eq!(link.other_node("node1"), "node2");
        assert_eq!(link.other_node("node2"), "node1");
        assert_eq!(link.iface_from_node("node1"), "if1");
        assert_eq!(link.iface_from_node("node2"), "if2");
        assert_eq!(link.metric_from_node("node1"), 1);
        assert_eq!(link.metric_from_node("node2"), 2);
        assert_eq!(link.adj_label_from_node("node1"), 100);
        assert_eq!(link.adj_label_from_node("node2"), 200);
        assert!(link.is_up());
    }

    #[test]
    fn test_link_key_is_order_independent() {
        let adj1 = adj("node2", "if1", "if2", 1, 0);
        let adj2 = adj("node1", "if2", "if1", 1, 0);
        let l1 = Link::new("area0", "node1", &adj1, "node2", &adj2);
        let l2 = Link::new("area0", "node2", &adj2, "node1", &adj1);
        assert_eq!(l1.key(), l2.key());
    }

    #[test]
    fn test_overload_takes_link_down() {
        let adj1 = adj("node2", "if1", "if2", 1, 0);
        let adj2 = adj("node1", "if2", "if1", 1, 0);
        let mut link = Link::new("area0", "node1", &adj1, "node2", &adj2);

        assert!(link.set_overload_from_node("node2", true));
        assert!(!link.is_up());
        assert!(link.overload_from_node("node2"));
        assert!(!link.overload_from_node("node1"));
        // Setting it again changes nothing.
        assert!(!link.set_overload_from_node("node2", true));
    }

    #[test]
    fn test_holdable_value_hold_and_expiry() {
        let mut hv = HoldableValue::new(true);
        assert!(hv.value());
        assert!(!hv.has_hold());
        assert!(!hv.decrement_ttl());

        let (hold_up, hold_down) = (10, 5);
        // false is the bring-up direction for overload bits.
        assert!(!hv.update_value(false, hold_up, hold_down));
        for _ in 0..hold_up - 1 {
            assert!(hv.has_hold());
            assert!(hv.value());
            assert!(!hv.decrement_ttl());
        }
        assert!(hv.decrement_ttl());
        assert!(!hv.has_hold());
        assert!(!hv.value());

        // Same value is a no-op.
        assert!(!hv.update_value(false, hold_up, hold_down));
        assert!(!hv.has_hold());

        // Bring-down direction uses the down TTL.
        assert!(!hv.update_value(true, hold_up, hold_down));
        for _ in 0..hold_down - 1 {
            assert!(hv.has_hold());
            assert!(!hv.value());
            assert!(!hv.decrement_ttl());
        }
        assert!(hv.decrement_ttl());
        assert!(hv.value());

        // A second change within a hold falls back to a fast update.
        assert!(!hv.update_value(false, hold_up, hold_down));
        assert!(hv.has_hold());
        assert!(hv.update_value(true, hold_up, hold_down));
        assert!(!hv.has_hold());
        assert!(hv.value());
    }

    #[test]
    fn test_holdable_metric_bring_up_is_decrease() {
        let mut hv: HoldableValue<LinkStateMetric> = HoldableValue::new(10);
        assert_eq!(hv.value(), 10);
        // Lowering the metric is bring-up and gets the up TTL.
        assert!(!hv.update_value(5, 10, 5));
        for _ in 0..9 {
            assert_eq!(hv.value(), 10);
            assert!(!hv.decrement_ttl());
        }
        assert!(hv.decrement_ttl());
        assert_eq!(hv.value(), 5);
    }

    #[test]
    fn test_zero_hold_ttl_is_immediate() {
        let mut hv = HoldableValue::new(true);
        assert!(hv.update_value(false, 0, 0));
        assert!(!hv.has_hold());
        assert!(!hv.value());
    }
}
