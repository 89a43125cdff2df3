//! CLI configuration for the Trellis daemon.
//!
//! Flags can also be supplied via `TRELLIS__`-prefixed environment
//! variables; CLI arguments override the environment.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use trellis_types::config::{ConfigError, DecisionConfig, FloodRate, KvStoreConfig};

/// How daemon logs are formatted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable output.
    Text,
    /// Line-delimited JSON.
    Json,
}

/// Trellis routing platform daemon.
#[derive(Debug, Parser)]
#[command(name = "trellisd", version, about)]
pub struct Cli {
    /// Unique name of this node in the routing domain.
    #[arg(long, env = "TRELLIS__NODE_NAME")]
    pub node_name: String,

    /// Comma-separated routing areas this node participates in.
    #[arg(long, env = "TRELLIS__AREAS", value_delimiter = ',', default_value = "0")]
    pub areas: Vec<String>,

    /// TTL for self-originated keys, in milliseconds.
    #[arg(long, env = "TRELLIS__KEY_TTL_MS", default_value_t = 300_000)]
    pub key_ttl_ms: u64,

    /// TTL decrement applied before flooding onward, in milliseconds.
    #[arg(long, env = "TRELLIS__TTL_DECREMENT_MS", default_value_t = 1)]
    pub ttl_decrement_ms: u64,

    /// Sustained flood rate in publications per second (unlimited when
    /// unset).
    #[arg(long, env = "TRELLIS__FLOOD_MSG_PER_SEC")]
    pub flood_msg_per_sec: Option<u32>,

    /// Flood burst size above the sustained rate.
    #[arg(long, env = "TRELLIS__FLOOD_MSG_BURST_SIZE", default_value_t = 32)]
    pub flood_msg_burst_size: u32,

    /// Run as a leaf node, accepting only filtered keys.
    #[arg(long, env = "TRELLIS__SET_LEAF_NODE")]
    pub set_leaf_node: bool,

    /// Key prefixes accepted in leaf mode.
    #[arg(long, env = "TRELLIS__KEY_PREFIX_FILTERS", value_delimiter = ',')]
    pub key_prefix_filters: Vec<String>,

    /// Originator ids accepted in leaf mode.
    #[arg(long, env = "TRELLIS__KEY_ORIGINATOR_ID_FILTERS", value_delimiter = ',')]
    pub key_originator_id_filters: Vec<String>,

    /// IP type-of-service marking for peer sockets.
    #[arg(long, env = "TRELLIS__IP_TOS")]
    pub ip_tos: Option<i32>,

    /// Disable IPv4 route computation (enabled by default).
    #[arg(long, env = "TRELLIS__NO_V4")]
    pub no_v4: bool,

    /// Program v4 prefixes over v6 next hops.
    #[arg(long, env = "TRELLIS__V4_OVER_V6_NEXTHOP")]
    pub v4_over_v6_nexthop: bool,

    /// Install MPLS routes for node segment labels.
    #[arg(long, env = "TRELLIS__ENABLE_NODE_SEGMENT_LABEL")]
    pub enable_node_segment_label: bool,

    /// Install MPLS routes for adjacency labels.
    #[arg(long, env = "TRELLIS__ENABLE_ADJACENCY_LABELS")]
    pub enable_adjacency_labels: bool,

    /// Prometheus exporter listen address (disabled when unset).
    #[arg(long, env = "TRELLIS__METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Log output format.
    #[arg(long, env = "TRELLIS__LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Cli {
    /// Builds the validated KvStore configuration.
    pub fn kvstore_config(&self) -> Result<KvStoreConfig, ConfigError> {
        let flood_rate = self.flood_msg_per_sec.map(|flood_msg_per_sec| FloodRate {
            flood_msg_per_sec,
            flood_msg_burst_size: self.flood_msg_burst_size,
        });
        let config = KvStoreConfig::builder()
            .node_name(self.node_name.clone())
            .key_ttl(Duration::from_millis(self.key_ttl_ms))
            .ttl_decrement(Duration::from_millis(self.ttl_decrement_ms))
            .maybe_flood_rate(flood_rate)
            .set_leaf_node(self.set_leaf_node)
            .key_prefix_filters(self.key_prefix_filters.clone())
            .key_originator_id_filters(self.key_originator_id_filters.clone())
            .maybe_ip_tos(self.ip_tos)
            .build();
        config.validate()?;
        Ok(config)
    }

    /// Builds the validated Decision configuration.
    pub fn decision_config(&self) -> Result<DecisionConfig, ConfigError> {
        let config = DecisionConfig::builder()
            .enable_v4(!self.no_v4)
            .v4_over_v6_nexthop(self.v4_over_v6_nexthop)
            .enable_node_segment_label(self.enable_node_segment_label)
            .enable_adjacency_labels(self.enable_adjacency_labels)
            .build();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["trellisd", "--node-name", "node1"]);
        assert_eq!(cli.areas, vec!["0".to_string()]);
        let config = cli.kvstore_config().unwrap();
        assert_eq!(config.key_ttl, Duration::from_millis(300_000));
        assert!(config.flood_rate.is_none());
        assert!(cli.decision_config().is_ok());
    }

    #[test]
    fn test_cli_flood_rate() {
        let cli = Cli::parse_from([
            "trellisd",
            "--node-name",
            "node1",
            "--flood-msg-per-sec",
            "100",
            "--flood-msg-burst-size",
            "16",
        ]);
        let config = cli.kvstore_config().unwrap();
        let rate = config.flood_rate.unwrap();
        assert_eq!(rate.flood_msg_per_sec, 100);
        assert_eq!(rate.flood_msg_burst_size, 16);
    }

    #[test]
    fn test_cli_rejects_leaf_mode_without_filters() {
        let cli = Cli::parse_from(["trellisd", "--node-name", "node1", "--set-leaf-node"]);
        assert!(cli.kvstore_config().is_err());
    }

    #[test]
    fn test_cli_multiple_areas() {
        let cli =
            Cli::parse_from(["trellisd", "--node-name", "node1", "--areas", "spine,pod1,pod2"]);
        assert_eq!(cli.areas.len(), 3);
    }
}
