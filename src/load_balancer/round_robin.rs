//! Round-robin over a cluster's endpoint hosts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{host::Host, LoadBalancer};

/// Default `lb_policy`. The cursor advances once per pick, whether or not
/// the host under it is healthy.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_server(&self, hosts: &[Arc<Host>]) -> Option<Arc<Host>> {
        if hosts.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        hosts
            .iter()
            .cycle()
            .skip(start % hosts.len())
            .take(hosts.len())
            .find(|host| host.is_healthy())
            .cloned()
    }
}
