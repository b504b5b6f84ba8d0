//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Router has no affinity destination for a message
//!     → cluster asks its LoadBalancer for a host
//!         - round_robin.rs (rotate through hosts)
//!         - least_conn.rs (pick host with fewest connections)
//!     → host.rs (connection guard, passive health)
//!     → Return host or None (no healthy upstream)
//! ```
//!
//! # Design Decisions
//! - Load balancer is stateless apart from its cursor; hosts track connections
//! - Algorithm selection per cluster
//! - Unhealthy hosts excluded from selection

use std::sync::Arc;

pub mod host;
pub mod least_conn;
pub mod round_robin;

use host::Host;

/// Host selection strategy.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    /// Pick the next host, or `None` when no host is usable.
    fn next_server(&self, hosts: &[Arc<Host>]) -> Option<Arc<Host>>;
}

/// Build the strategy named in cluster configuration.
pub fn from_policy(policy: &str) -> Box<dyn LoadBalancer> {
    match policy {
        "least_conn" => Box::new(least_conn::LeastConnections::new()),
        _ => Box::new(round_robin::RoundRobin::new()),
    }
}
