//! `sip-router.toml` layout.
//!
//! Every section and most fields default, see `RouterConfig::default` and
//! the `default_*` functions below.

use serde::{Deserialize, Serialize};

/// Root configuration for the SIP router.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Number of worker threads (event loops).
    pub concurrency: usize,

    /// Prefix attached to every router counter.
    pub stat_prefix: String,

    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Transaction and TRA settings.
    pub settings: SettingsConfig,

    /// Route table mapping messages to clusters.
    pub route_config: RouteTableConfig,

    /// Upstream clusters.
    pub clusters: Vec<ClusterConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            stat_prefix: "sip".to_string(),
            listener: ListenerConfig::default(),
            settings: SettingsConfig::default(),
            route_config: RouteTableConfig::default(),
            clusters: Vec::new(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:5060").
    pub bind_address: String,

    /// Maximum concurrent downstream connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5060".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Proxy-wide transaction settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Idle lifetime of a transaction before the audit resets it.
    pub transaction_timeout_ms: u64,

    /// Period of the transaction audit sweep.
    pub audit_interval_ms: u64,

    /// Domains served by this proxy itself.
    pub local_services: Vec<LocalServiceConfig>,

    /// Traffic routing assistant service.
    pub tra_service_config: Option<TraServiceConfig>,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            transaction_timeout_ms: 32_000,
            audit_interval_ms: 2_000,
            local_services: Vec::new(),
            tra_service_config: None,
        }
    }
}

/// A domain that names this proxy, matched on a header parameter.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LocalServiceConfig {
    pub domain: String,
    pub parameter: String,
}

/// Traffic routing assistant client settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TraServiceConfig {
    /// Base URL of the TRA service (e.g., "http://tra:8080").
    pub endpoint: String,

    /// Per-query timeout.
    pub timeout_ms: u64,

    /// Maximum cached keys per affinity type.
    pub max_cache_items: usize,
}

impl Default for TraServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout_ms: 2_000,
            max_cache_items: 10_000,
        }
    }
}

/// Ordered route table.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RouteTableConfig {
    pub name: String,
    pub routes: Vec<RouteConfig>,
}

/// One route: a match condition and the cluster it selects.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    /// Route identifier for logging.
    #[serde(default)]
    pub name: String,

    #[serde(rename = "match")]
    pub match_: RouteMatchConfig,

    pub route: RouteActionConfig,
}

/// Route match condition.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RouteMatchConfig {
    /// Domain to compare against; "*" matches any present header.
    pub domain: String,

    /// Header to read; empty means Route.
    pub header: String,

    /// Header parameter carrying the domain; "host" uses the URI host.
    pub parameter: String,
}

/// Route action.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteActionConfig {
    pub cluster: String,
}

/// Upstream cluster definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Unique cluster name referenced by routes.
    pub name: String,

    /// Upstream endpoints (e.g., "10.0.0.1:5060").
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Load balancing policy: "round_robin" or "least_conn".
    #[serde(default = "default_lb_policy")]
    pub lb_policy: String,

    /// Maximum concurrent connections to one host.
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: usize,

    /// Connection establishment timeout.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Reject all traffic while set.
    #[serde(default)]
    pub maintenance_mode: bool,

    /// Accept destinations outside `endpoints` (affinity to any address).
    #[serde(default)]
    pub original_dst: bool,

    /// Port used for destinations given without one.
    #[serde(default = "default_sip_port")]
    pub default_port: u16,

    /// Consecutive connect failures before a host is skipped.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: usize,

    /// Consecutive successes before a skipped host is used again.
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: usize,

    /// SIP protocol options for this cluster.
    #[serde(default)]
    pub protocol_options: ProtocolOptionsConfig,
}

fn default_lb_policy() -> String {
    "round_robin".to_string()
}

fn default_max_connections_per_host() -> usize {
    1024
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_sip_port() -> u16 {
    5060
}

fn default_unhealthy_threshold() -> usize {
    3
}

fn default_healthy_threshold() -> usize {
    1
}

/// Per-cluster SIP options.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ProtocolOptionsConfig {
    /// Pin dialogs to the `ep` of their Route header.
    pub session_affinity: bool,

    /// Pin REGISTER refreshes to the registrar named by the Opaque value.
    pub registration_affinity: bool,

    /// Header-derived affinity candidates.
    pub customized_affinity: CustomizedAffinityConfig,

    /// Allow requests initiated by upstream hosts.
    pub upstream_transactions: UpstreamTransactionsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct CustomizedAffinityConfig {
    pub entries: Vec<AffinityEntryConfig>,

    /// Fail instead of load balancing when no candidate resolves.
    pub stop_load_balance: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AffinityEntryConfig {
    /// Header to read; empty is only valid for the "ep" key.
    pub header: String,

    /// Parameter name, "ep", or "text" for the whole header value.
    pub key_name: String,

    /// Ask the TRA service on a cache miss.
    pub query: bool,

    /// Subscribe to this affinity type on the TRA service.
    pub subscribe: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamTransactionsConfig {
    pub enabled: bool,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
