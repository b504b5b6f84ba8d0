//! Upstream cluster subsystem.
//!
//! # Data Flow
//! ```text
//! Router (cluster name from the matched route)
//!     → ClusterManager::get_thread_local_cluster
//!     → ThreadLocalCluster::tcp_conn_pool(destination)
//!         - static_cluster.rs (endpoint match, original destination, or LB)
//!     → TcpConnPool::new_connection(PoolCallbacks)
//!         - tcp_pool.rs (tokio connect, writer/reader tasks)
//!     → PoolCallbacks::on_pool_ready(UpstreamTransport) / on_pool_failure
//!     → UpstreamTransport delivers bytes to UpstreamCallbacks
//! ```
//!
//! # Design Decisions
//! - The router only sees the traits below, so tests drive it with fakes
//! - One instance per worker: `Rc`, no locking on the hot path
//! - A pool may report readiness synchronously (`PoolHandle::Ready`)

use std::rc::{Rc, Weak};
use std::sync::Arc;

use bytes::Bytes;

use crate::config::ProtocolOptionsConfig;
use crate::load_balancer::host::Host;

pub mod static_cluster;
pub mod tcp_pool;

pub use static_cluster::{StaticCluster, StaticClusterManager};

/// Immutable per-cluster settings the router consults.
#[derive(Debug, Clone, Default)]
pub struct ClusterInfo {
    pub name: String,
    pub maintenance_mode: bool,
    pub options: ProtocolOptionsConfig,
    pub unhealthy_threshold: usize,
    pub healthy_threshold: usize,
}

impl ClusterInfo {
    pub fn new(name: impl Into<String>, options: ProtocolOptionsConfig) -> Self {
        Self {
            name: name.into(),
            maintenance_mode: false,
            options,
            unhealthy_threshold: 3,
            healthy_threshold: 1,
        }
    }
}

/// Host selection hints passed to the cluster.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadBalancerContext<'a> {
    /// Address pinned by affinity ("ip" or "ip:port").
    pub destination: Option<&'a str>,
}

pub trait ClusterManager {
    fn get_thread_local_cluster(&self, name: &str) -> Option<Rc<dyn ThreadLocalCluster>>;
}

pub trait ThreadLocalCluster {
    fn info(&self) -> Arc<ClusterInfo>;

    /// Pool for the host selected with `context`, or `None` when no host
    /// is usable.
    fn tcp_conn_pool(&self, context: &LoadBalancerContext<'_>) -> Option<Rc<dyn TcpConnPool>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFailureReason {
    Overflow,
    LocalConnectionFailure,
    RemoteConnectionFailure,
    Timeout,
}

/// Outcome of a connection request that did not fail immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolHandle {
    /// `on_pool_ready` already ran.
    Ready,
    /// A callback will follow.
    Pending,
}

pub trait TcpConnPool {
    fn host(&self) -> Option<Arc<Host>>;

    fn new_connection(&self, callbacks: Rc<dyn PoolCallbacks>) -> Result<PoolHandle, PoolFailureReason>;
}

pub trait PoolCallbacks {
    fn on_pool_ready(&self, transport: Rc<dyn UpstreamTransport>, host: Arc<Host>);

    fn on_pool_failure(&self, reason: PoolFailureReason, host: Option<Arc<Host>>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    RemoteClose,
    LocalClose,
}

/// A live upstream connection.
pub trait UpstreamTransport {
    /// Queue bytes; writes are flushed in call order.
    fn write(&self, data: Bytes);

    fn close(&self);

    fn is_open(&self) -> bool;

    fn set_upstream_callbacks(&self, callbacks: Weak<dyn UpstreamCallbacks>);
}

pub trait UpstreamCallbacks {
    fn on_upstream_data(&self, data: &[u8]);

    fn on_event(&self, event: ConnectionEvent);
}
