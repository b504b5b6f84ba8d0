//! An upstream SIP endpoint as seen by one worker.
//!
//! # Responsibilities
//! - Name the host by its IP, the key used in affinity destinations,
//!   pending-connection lists and transaction tables
//! - Count open upstream connections and cap them at `max_connections`
//! - Track passive health from connect outcomes
//!
//! # Design Decisions
//! - A host starts out usable. It leaves rotation after
//!   `unhealthy_threshold` consecutive connect failures and returns after
//!   `healthy_threshold` consecutive successes
//! - Pinned destinations bypass health; only load balancing consults it

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct Host {
    pub addr: SocketAddr,
    pub max_connections: usize,
    key: String,
    open_connections: AtomicUsize,
    unhealthy: AtomicBool,
    failure_streak: AtomicUsize,
    success_streak: AtomicUsize,
}

impl Host {
    pub fn new(addr: SocketAddr, max_connections: usize) -> Self {
        Self {
            addr,
            max_connections,
            key: addr.ip().to_string(),
            open_connections: AtomicUsize::new(0),
            unhealthy: AtomicBool::new(false),
            failure_streak: AtomicUsize::new(0),
            success_streak: AtomicUsize::new(0),
        }
    }

    /// The IP address as text.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether an affinity destination ("ip" or "ip:port") names this host.
    pub fn matches_destination(&self, destination: &str) -> bool {
        destination == self.key || destination.parse::<SocketAddr>().is_ok_and(|addr| addr == self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.open_connections.load(Ordering::Relaxed)
    }

    /// Reserve a connection slot, or `None` when the host is at its cap.
    pub fn try_create_guard(self: &Arc<Self>) -> Option<HostConnectionGuard> {
        self.open_connections
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |open| {
                (open < self.max_connections).then_some(open + 1)
            })
            .ok()?;
        Some(HostConnectionGuard { host: self.clone() })
    }

    pub fn is_healthy(&self) -> bool {
        !self.unhealthy.load(Ordering::Relaxed)
    }

    /// Record a successful connect. True when the host comes back.
    pub fn mark_success(&self, healthy_threshold: usize) -> bool {
        self.failure_streak.store(0, Ordering::Relaxed);
        if self.is_healthy() {
            return false;
        }
        let streak = self.success_streak.fetch_add(1, Ordering::Relaxed) + 1;
        streak >= healthy_threshold && self.unhealthy.swap(false, Ordering::Relaxed)
    }

    /// Record a failed connect. True when the host leaves rotation.
    pub fn mark_failure(&self, unhealthy_threshold: usize) -> bool {
        self.success_streak.store(0, Ordering::Relaxed);
        if !self.is_healthy() {
            return false;
        }
        let streak = self.failure_streak.fetch_add(1, Ordering::Relaxed) + 1;
        streak >= unhealthy_threshold && !self.unhealthy.swap(true, Ordering::Relaxed)
    }
}

/// One open upstream connection; frees its slot on drop.
#[derive(Debug)]
pub struct HostConnectionGuard {
    host: Arc<Host>,
}

impl HostConnectionGuard {
    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }
}

impl Drop for HostConnectionGuard {
    fn drop(&mut self) {
        self.host.open_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_enforces_limit() {
        let host = Arc::new(Host::new("10.0.0.1:5060".parse().unwrap(), 1));
        let guard = host.try_create_guard().unwrap();
        assert!(host.try_create_guard().is_none());
        drop(guard);
        assert_eq!(host.connection_count(), 0);
        assert!(host.try_create_guard().is_some());
    }

    #[test]
    fn test_passive_health() {
        let host = Host::new("10.0.0.1:5060".parse().unwrap(), 1);
        assert!(!host.mark_failure(2));
        assert!(host.mark_failure(2));
        assert!(!host.is_healthy());
        assert!(host.mark_success(1));
        assert!(host.is_healthy());
    }

    #[test]
    fn test_destination_match() {
        let host = Host::new("10.0.0.1:5070".parse().unwrap(), 1);
        assert_eq!(host.key(), "10.0.0.1");
        assert!(host.matches_destination("10.0.0.1"));
        assert!(host.matches_destination("10.0.0.1:5070"));
        assert!(!host.matches_destination("10.0.0.2"));
    }
}
