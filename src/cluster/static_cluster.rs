//! Clusters built from static configuration.
//!
//! # Responsibilities
//! - Hold the endpoint hosts and load balancer of each configured cluster
//! - Honor an affinity destination when it names an endpoint
//! - Create hosts on demand for `original_dst` clusters
//! - Keep one connection pool per host
//!
//! # Design Decisions
//! - Built once per worker; host connection counts are per worker
//! - An affinity destination outside the endpoint list falls back to load
//!   balancing unless the cluster accepts original destinations

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::tcp_pool::TokioTcpConnPool;
use crate::cluster::{ClusterInfo, ClusterManager, LoadBalancerContext, TcpConnPool, ThreadLocalCluster};
use crate::config::ClusterConfig;
use crate::load_balancer::{self, host::Host, LoadBalancer};

/// Cluster manager over `[[clusters]]`.
#[derive(Default)]
pub struct StaticClusterManager {
    clusters: HashMap<String, Rc<StaticCluster>>,
}

impl StaticClusterManager {
    pub fn new(configs: &[ClusterConfig]) -> Self {
        let clusters = configs
            .iter()
            .map(|config| (config.name.clone(), Rc::new(StaticCluster::new(config))))
            .collect();
        Self { clusters }
    }

    pub fn cluster(&self, name: &str) -> Option<Rc<StaticCluster>> {
        self.clusters.get(name).cloned()
    }
}

impl ClusterManager for StaticClusterManager {
    fn get_thread_local_cluster(&self, name: &str) -> Option<Rc<dyn ThreadLocalCluster>> {
        self.clusters
            .get(name)
            .map(|cluster| cluster.clone() as Rc<dyn ThreadLocalCluster>)
    }
}

pub struct StaticCluster {
    info: Arc<ClusterInfo>,
    hosts: Vec<Arc<Host>>,
    lb: Box<dyn LoadBalancer>,
    original_dst: bool,
    default_port: u16,
    max_connections_per_host: usize,
    connect_timeout: Duration,
    /// Host key -> pool (covers endpoint and original destination hosts).
    pools: RefCell<HashMap<String, Rc<TokioTcpConnPool>>>,
}

impl StaticCluster {
    pub fn new(config: &ClusterConfig) -> Self {
        let mut hosts = Vec::with_capacity(config.endpoints.len());
        for endpoint in &config.endpoints {
            match endpoint.parse::<SocketAddr>() {
                Ok(addr) => hosts.push(Arc::new(Host::new(addr, config.max_connections_per_host))),
                Err(_) => tracing::warn!(cluster = %config.name, endpoint = %endpoint, "Invalid endpoint address"),
            }
        }

        let info = ClusterInfo {
            name: config.name.clone(),
            maintenance_mode: config.maintenance_mode,
            options: config.protocol_options.clone(),
            unhealthy_threshold: config.unhealthy_threshold,
            healthy_threshold: config.healthy_threshold,
        };

        Self {
            info: Arc::new(info),
            hosts,
            lb: load_balancer::from_policy(&config.lb_policy),
            original_dst: config.original_dst,
            default_port: config.default_port,
            max_connections_per_host: config.max_connections_per_host,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            pools: RefCell::new(HashMap::new()),
        }
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    /// Host for `destination`, without load balancing.
    fn pinned_host(&self, destination: &str) -> Option<Arc<Host>> {
        if let Some(host) = self.hosts.iter().find(|h| h.matches_destination(destination)) {
            return Some(host.clone());
        }
        if !self.original_dst {
            tracing::debug!(
                cluster = %self.info.name,
                destination = %destination,
                "Destination is not a cluster endpoint, load balancing"
            );
            return None;
        }

        let addr = destination
            .parse::<SocketAddr>()
            .ok()
            .or_else(|| destination.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, self.default_port)));
        let Some(addr) = addr else {
            tracing::debug!(destination = %destination, "Destination is not an address");
            return None;
        };

        let key = addr.ip().to_string();
        if let Some(pool) = self.pools.borrow().get(&key) {
            return pool.host();
        }
        Some(Arc::new(Host::new(addr, self.max_connections_per_host)))
    }

    fn pool_for(&self, host: Arc<Host>) -> Rc<TokioTcpConnPool> {
        self.pools
            .borrow_mut()
            .entry(host.key().to_string())
            .or_insert_with(|| Rc::new(TokioTcpConnPool::new(host, self.connect_timeout)))
            .clone()
    }
}

impl ThreadLocalCluster for StaticCluster {
    fn info(&self) -> Arc<ClusterInfo> {
        self.info.clone()
    }

    fn tcp_conn_pool(&self, context: &LoadBalancerContext<'_>) -> Option<Rc<dyn TcpConnPool>> {
        let host = context
            .destination
            .and_then(|destination| self.pinned_host(destination))
            .or_else(|| self.lb.next_server(&self.hosts));

        match host {
            Some(host) => Some(self.pool_for(host) as Rc<dyn TcpConnPool>),
            None => {
                tracing::debug!(
                    cluster = %self.info.name,
                    host_count = self.hosts.len(),
                    "No healthy hosts found in cluster"
                );
                None
            }
        }
    }
}
