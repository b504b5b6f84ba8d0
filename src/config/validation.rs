//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (routes reference existing clusters)
//! - Validate value ranges (timeouts > 0, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RouterConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::RouterConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a parsed configuration, collecting every error found.
pub fn validate_config(config: &RouterConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.concurrency == 0 {
        errors.push(ValidationError::new("concurrency", "must be at least 1"));
    }

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("invalid address '{}'", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }

    if config.settings.transaction_timeout_ms == 0 {
        errors.push(ValidationError::new(
            "settings.transaction_timeout_ms",
            "must be greater than 0",
        ));
    }
    if config.settings.audit_interval_ms == 0 {
        errors.push(ValidationError::new(
            "settings.audit_interval_ms",
            "must be greater than 0",
        ));
    }
    if let Some(tra) = &config.settings.tra_service_config {
        if tra.endpoint.is_empty() {
            errors.push(ValidationError::new(
                "settings.tra_service_config.endpoint",
                "must not be empty",
            ));
        }
        if tra.timeout_ms == 0 {
            errors.push(ValidationError::new(
                "settings.tra_service_config.timeout_ms",
                "must be greater than 0",
            ));
        }
    }

    let mut cluster_names = HashSet::new();
    for (i, cluster) in config.clusters.iter().enumerate() {
        let field = format!("clusters[{}]", i);
        if !cluster_names.insert(cluster.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.name", field),
                format!("duplicate cluster '{}'", cluster.name),
            ));
        }
        if cluster.endpoints.is_empty() && !cluster.original_dst {
            errors.push(ValidationError::new(
                format!("{}.endpoints", field),
                "at least one endpoint is required unless original_dst is set",
            ));
        }
        // Hosts are keyed by IP alone, so two ports on one IP would share
        // a pool and an upstream connection.
        let mut endpoint_ips = HashSet::new();
        for endpoint in &cluster.endpoints {
            match endpoint.parse::<SocketAddr>() {
                Ok(addr) if !endpoint_ips.insert(addr.ip()) => {
                    errors.push(ValidationError::new(
                        format!("{}.endpoints", field),
                        format!("more than one endpoint on {}", addr.ip()),
                    ));
                }
                Ok(_) => {}
                Err(_) => {
                    errors.push(ValidationError::new(
                        format!("{}.endpoints", field),
                        format!("invalid address '{}'", endpoint),
                    ));
                }
            }
        }
        if !matches!(cluster.lb_policy.as_str(), "round_robin" | "least_conn") {
            errors.push(ValidationError::new(
                format!("{}.lb_policy", field),
                format!("unknown policy '{}'", cluster.lb_policy),
            ));
        }
        if cluster.connect_timeout_ms == 0 {
            errors.push(ValidationError::new(
                format!("{}.connect_timeout_ms", field),
                "must be greater than 0",
            ));
        }
        if cluster.max_connections_per_host == 0 {
            errors.push(ValidationError::new(
                format!("{}.max_connections_per_host", field),
                "must be greater than 0",
            ));
        }
    }

    for (i, route) in config.route_config.routes.iter().enumerate() {
        if !cluster_names.contains(route.route.cluster.as_str()) {
            errors.push(ValidationError::new(
                format!("route_config.routes[{}].route.cluster", i),
                format!("unknown cluster '{}'", route.route.cluster),
            ));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("invalid address '{}'", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ClusterConfig, ProtocolOptionsConfig};

    fn cluster(name: &str, endpoints: &[&str]) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
            lb_policy: "round_robin".to_string(),
            max_connections_per_host: 10,
            connect_timeout_ms: 1000,
            maintenance_mode: false,
            original_dst: false,
            default_port: 5060,
            unhealthy_threshold: 3,
            healthy_threshold: 1,
            protocol_options: ProtocolOptionsConfig::default(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&RouterConfig::default()).is_ok());
    }

    #[test]
    fn test_rejects_endpoints_sharing_an_ip() {
        let mut config = RouterConfig::default();
        config.clusters.push(cluster("c1", &["10.0.0.1:5060", "10.0.0.1:5070"]));
        config.clusters.push(cluster("c2", &["10.0.0.1:5060", "10.0.0.2:5060"]));

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "clusters[0].endpoints");
        assert!(errors[0].message.contains("10.0.0.1"));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = RouterConfig::default();
        config.listener.bind_address = "not-an-address".into();
        config.clusters.push(cluster("c1", &["bad"]));
        config.clusters.push(cluster("c1", &[]));

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"listener.bind_address"));
        assert!(fields.contains(&"clusters[0].endpoints"));
        assert!(fields.contains(&"clusters[1].name"));
        assert!(fields.contains(&"clusters[1].endpoints"));
    }

    #[test]
    fn test_original_dst_without_endpoints() {
        let mut config = RouterConfig::default();
        let mut c = cluster("dynamic", &[]);
        c.original_dst = true;
        config.clusters.push(c);
        assert!(validate_config(&config).is_ok());
    }
}
