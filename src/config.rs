//! Client configuration
//!
//! Everything consumed at construction. All health and pool state is
//! process-memory only and rebuilt from this configuration; nothing is
//! persisted across restarts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::pool::ResurrectStrategy;
use crate::serializer::PoisoningAction;
use crate::types::{BasicAuth, NodeDescriptor, Roles};

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Cluster nodes: URL strings or full descriptors with roles/headers
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,

    /// Retry budget per logical request (attempts = max_retries + 1)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Resurrection-probe timeout in milliseconds
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,

    /// Periodic topology refresh interval; disabled when absent
    #[serde(default)]
    pub sniff_interval_ms: Option<u64>,

    /// Refresh topology immediately at construction
    #[serde(default)]
    pub sniff_on_start: bool,

    /// Refresh topology after a connection is marked dead
    #[serde(default)]
    pub sniff_on_connection_fault: bool,

    /// Discovery endpoint returning the cluster node list
    #[serde(default = "default_sniff_endpoint")]
    pub sniff_endpoint: String,

    #[serde(default)]
    pub resurrect_strategy: ResurrectStrategy,

    /// Gzip request bodies above the compression threshold
    #[serde(default)]
    pub compression: bool,

    /// Ask the server to compress responses
    #[serde(default)]
    pub suggest_compression: bool,

    /// Minimum body size worth compressing, in bytes
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,

    #[serde(default)]
    pub tls: TlsConfig,

    /// Proxy URL applied to every connection
    #[serde(default)]
    pub proxy: Option<String>,

    /// Basic credentials baked into every connection
    #[serde(default)]
    pub auth: Option<BasicAuth>,

    #[serde(default)]
    pub memory_circuit_breaker: MemoryCircuitBreakerConfig,

    /// Policy for a reserved `__proto__` key in decoded payloads
    #[serde(default)]
    pub proto_poisoning: PoisoningAction,

    /// Policy for a reserved `constructor` key in decoded payloads
    #[serde(default)]
    pub constructor_poisoning: PoisoningAction,

    /// Static headers attached to every request
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Client instance name recorded in envelope metadata
    #[serde(default = "default_name")]
    pub name: String,

    /// Prefix for the opaque-id correlation header
    #[serde(default)]
    pub opaque_id_prefix: Option<String>,

    /// Server statuses the transport may retry instead of wrapping as a
    /// response error; empty by default
    #[serde(default)]
    pub retry_on_statuses: Vec<u16>,

    /// Base of the dead-connection backoff schedule, milliseconds
    #[serde(default = "default_resurrect_base")]
    pub resurrect_base_ms: u64,

    /// Cap of the dead-connection backoff schedule, milliseconds
    #[serde(default = "default_resurrect_cap")]
    pub resurrect_cap_ms: u64,

    /// Drop nodes absent from a sniffed topology
    #[serde(default = "default_true")]
    pub drop_vanished_nodes: bool,
}

/// One configured node: a bare URL or a full descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeEntry {
    Url(String),
    Descriptor {
        url: String,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        roles: Option<Roles>,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl NodeEntry {
    pub fn to_descriptor(&self) -> NodeDescriptor {
        match self {
            NodeEntry::Url(url) => NodeDescriptor::new(url.clone()),
            NodeEntry::Descriptor {
                url,
                id,
                roles,
                headers,
            } => NodeDescriptor {
                url: url.clone(),
                id: id.clone(),
                roles: *roles,
                headers: headers.clone(),
            },
        }
    }
}

/// TLS options. Certificate loading is handled by the embedding
/// application; only verification behavior is configured here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Skip peer certificate verification (INSECURE - for development only)
    #[serde(default)]
    pub skip_verify: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self { skip_verify: false }
    }
}

/// Backpressure gate refusing dispatch when reported cluster memory
/// utilization exceeds the threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Utilization percentage above which requests are refused
    #[serde(default = "default_max_percentage")]
    pub max_percentage: f64,
}

impl Default for MemoryCircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_percentage: default_max_percentage(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_ping_timeout() -> u64 {
    3_000
}

fn default_sniff_endpoint() -> String {
    "_nodes/_all/http".to_string()
}

fn default_compression_threshold() -> usize {
    1_024
}

fn default_name() -> String {
    "lodestone-client".to_string()
}

fn default_resurrect_base() -> u64 {
    60_000
}

fn default_resurrect_cap() -> u64 {
    30 * 60_000
}

fn default_max_percentage() -> f64 {
    95.0
}

fn default_true() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            max_retries: default_max_retries(),
            request_timeout_ms: default_request_timeout(),
            ping_timeout_ms: default_ping_timeout(),
            sniff_interval_ms: None,
            sniff_on_start: false,
            sniff_on_connection_fault: false,
            sniff_endpoint: default_sniff_endpoint(),
            resurrect_strategy: ResurrectStrategy::default(),
            compression: false,
            suggest_compression: false,
            compression_threshold_bytes: default_compression_threshold(),
            tls: TlsConfig::default(),
            proxy: None,
            auth: None,
            memory_circuit_breaker: MemoryCircuitBreakerConfig::default(),
            proto_poisoning: PoisoningAction::default(),
            constructor_poisoning: PoisoningAction::default(),
            headers: HashMap::new(),
            name: default_name(),
            opaque_id_prefix: None,
            retry_on_statuses: Vec::new(),
            resurrect_base_ms: default_resurrect_base(),
            resurrect_cap_ms: default_resurrect_cap(),
            drop_vanished_nodes: default_true(),
        }
    }
}

impl ClientConfig {
    /// Configuration for a single-node cluster
    pub fn single_node(url: impl Into<String>) -> Self {
        Self {
            nodes: vec![NodeEntry::Url(url.into())],
            ..Default::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn sniff_interval(&self) -> Option<Duration> {
        self.sniff_interval_ms.map(Duration::from_millis)
    }

    pub fn resurrect_base(&self) -> Duration {
        Duration::from_millis(self.resurrect_base_ms)
    }

    pub fn resurrect_cap(&self) -> Duration {
        Duration::from_millis(self.resurrect_cap_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.ping_timeout(), Duration::from_secs(3));
        assert!(config.sniff_interval().is_none());
        assert_eq!(config.resurrect_strategy, ResurrectStrategy::Ping);
        assert!(!config.memory_circuit_breaker.enabled);
        assert_eq!(config.proto_poisoning, PoisoningAction::Error);
    }

    #[test]
    fn test_node_entries_deserialize_from_urls_or_descriptors() {
        let json = r#"{
            "nodes": [
                "http://n1:9200",
                {"url": "http://n2:9200", "roles": {"cluster_manager": true, "data": false, "ingest": false}}
            ],
            "max_retries": 5
        }"#;
        let config: ClientConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.max_retries, 5);

        let descriptor = config.nodes[1].to_descriptor();
        assert!(descriptor.roles.unwrap().cluster_manager_only());
    }

    #[test]
    fn test_resurrect_strategy_deserializes_lowercase() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"resurrect_strategy": "optimistic"}"#).unwrap();
        assert_eq!(config.resurrect_strategy, ResurrectStrategy::Optimistic);
    }
}
