//! `lb_policy = "least_conn"`: the healthy host with the fewest open
//! upstream connections from this worker.

use std::sync::Arc;

use crate::load_balancer::{host::Host, LoadBalancer};

#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server(&self, hosts: &[Arc<Host>]) -> Option<Arc<Host>> {
        // Ties go to the first host.
        hosts
            .iter()
            .filter(|h| h.is_healthy())
            .min_by_key(|h| h.connection_count())
            .cloned()
    }
}
