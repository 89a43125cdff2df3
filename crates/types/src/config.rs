//! Configuration types for Trellis.
//!
//! All config structs validate their values via the `validate` method;
//! the server binary builds them from CLI flags and environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Default TTL for self-originated keys: 5 minutes.
pub const DEFAULT_KEY_TTL: Duration = Duration::from_millis(300_000);

/// Default TTL decrement applied before flooding onward: 1 ms.
pub const DEFAULT_TTL_DECREMENT: Duration = Duration::from_millis(1);

/// Configuration validation error.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A configuration value is outside its valid range.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },
}

/// Flooding rate limit knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, bon::Builder)]
pub struct FloodRate {
    /// Sustained publications per second.
    pub flood_msg_per_sec: u32,
    /// Burst size above the sustained rate.
    pub flood_msg_burst_size: u32,
}

/// Configuration for the KvStore subsystem, shared by all per-area
/// databases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bon::Builder)]
pub struct KvStoreConfig {
    /// The name of this node, unique in the routing domain.
    #[builder(into)]
    pub node_name: String,
    /// TTL applied to self-originated keys.
    #[serde(default = "default_key_ttl", with = "humantime_serde")]
    #[builder(default = DEFAULT_KEY_TTL)]
    pub key_ttl: Duration,
    /// TTL decrement applied to every value before flooding onward,
    /// guaranteeing monotone TTL reduction along any flooding chain.
    #[serde(default = "default_ttl_decrement", with = "humantime_serde")]
    #[builder(default = DEFAULT_TTL_DECREMENT)]
    pub ttl_decrement: Duration,
    /// Optional flood rate limit; unlimited when absent.
    #[serde(default)]
    pub flood_rate: Option<FloodRate>,
    /// Leaf mode: only accept keys matching the configured filters.
    #[serde(default)]
    #[builder(default)]
    pub set_leaf_node: bool,
    /// Key prefixes accepted in leaf mode.
    #[serde(default)]
    #[builder(default)]
    pub key_prefix_filters: Vec<String>,
    /// Originator ids accepted in leaf mode.
    #[serde(default)]
    #[builder(default)]
    pub key_originator_id_filters: Vec<String>,
    /// IP type-of-service marking for peer sockets, passed through to the
    /// transport.
    #[serde(default)]
    pub ip_tos: Option<i32>,
    /// Use TLS for peer clients.
    #[serde(default)]
    #[builder(default)]
    pub enable_secure_client: bool,
    /// TLS certificate path.
    #[serde(default)]
    pub x509_cert_path: Option<PathBuf>,
    /// TLS private key path.
    #[serde(default)]
    pub x509_key_path: Option<PathBuf>,
    /// TLS CA bundle path.
    #[serde(default)]
    pub x509_ca_path: Option<PathBuf>,
}

fn default_key_ttl() -> Duration {
    DEFAULT_KEY_TTL
}

fn default_ttl_decrement() -> Duration {
    DEFAULT_TTL_DECREMENT
}

impl KvStoreConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if:
    /// - `node_name` is empty
    /// - `key_ttl` is zero or not larger than `ttl_decrement`
    /// - `flood_rate` has a zero rate or burst
    /// - leaf mode is set without any filter
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.is_empty() {
            return Err(ConfigError::Validation { message: "node_name must not be empty".into() });
        }
        if self.key_ttl.is_zero() {
            return Err(ConfigError::Validation { message: "key_ttl must be positive".into() });
        }
        if self.ttl_decrement.is_zero() || self.ttl_decrement >= self.key_ttl {
            return Err(ConfigError::Validation {
                message: format!(
                    "ttl_decrement must be in (0, key_ttl); got {:?} with key_ttl {:?}",
                    self.ttl_decrement, self.key_ttl
                ),
            });
        }
        if let Some(rate) = &self.flood_rate {
            if rate.flood_msg_per_sec == 0 || rate.flood_msg_burst_size == 0 {
                return Err(ConfigError::Validation {
                    message: "flood_rate values must be positive".into(),
                });
            }
        }
        if self.set_leaf_node
            && self.key_prefix_filters.is_empty()
            && self.key_originator_id_filters.is_empty()
        {
            return Err(ConfigError::Validation {
                message: "set_leaf_node requires key or originator filters".into(),
            });
        }
        Ok(())
    }
}

/// Configuration for the Decision engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct DecisionConfig {
    /// Enable IPv4 route computation.
    #[serde(default)]
    #[builder(default = true)]
    pub enable_v4: bool,
    /// Program v4 prefixes over v6 next hops.
    #[serde(default)]
    #[builder(default)]
    pub v4_over_v6_nexthop: bool,
    /// Install MPLS routes for node segment labels.
    #[serde(default)]
    #[builder(default)]
    pub enable_node_segment_label: bool,
    /// Install MPLS routes for adjacency labels.
    #[serde(default)]
    #[builder(default)]
    pub enable_adjacency_labels: bool,
    /// Run metric-based best-route selection; when off every reachable
    /// advertisement is an ECMP candidate.
    #[serde(default)]
    #[builder(default = true)]
    pub enable_best_route_selection: bool,
    /// Debounce window before rebuilding routes after a topology change.
    #[serde(default = "default_debounce_min", with = "humantime_serde")]
    #[builder(default = Duration::from_millis(10))]
    pub debounce_min: Duration,
    /// Upper bound on route rebuild delay under continuous churn.
    #[serde(default = "default_debounce_max", with = "humantime_serde")]
    #[builder(default = Duration::from_millis(250))]
    pub debounce_max: Duration,
}

fn default_debounce_min() -> Duration {
    Duration::from_millis(10)
}

fn default_debounce_max() -> Duration {
    Duration::from_millis(250)
}

impl DecisionConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the debounce window is
    /// inverted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.debounce_min > self.debounce_max {
            return Err(ConfigError::Validation {
                message: format!(
                    "debounce_min {:?} must not exceed debounce_max {:?}",
                    self.debounce_min, self.debounce_max
                ),
            });
        }
        Ok(())
    }
}
