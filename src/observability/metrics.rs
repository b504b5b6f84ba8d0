//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Expose a Prometheus-compatible metrics endpoint
//! - Track live downstream and upstream connections
//!
//! # Metrics
//! - `sip_router_events_total` (counter): router events by prefix, stat
//! - `sip_router_downstream_connections` (gauge): accepted connections
//! - `sip_router_upstream_connections` (gauge): pooled connections
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every update is a no-op (unit tests)

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn downstream_connection_opened() {
    metrics::gauge!("sip_router_downstream_connections").increment(1.0);
}

pub fn downstream_connection_closed() {
    metrics::gauge!("sip_router_downstream_connections").decrement(1.0);
}

pub fn upstream_connection_opened() {
    metrics::gauge!("sip_router_upstream_connections").increment(1.0);
}

pub fn upstream_connection_closed() {
    metrics::gauge!("sip_router_upstream_connections").decrement(1.0);
}
