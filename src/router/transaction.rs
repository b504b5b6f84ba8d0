//! Transaction and upstream connection tables.
//!
//! # Responsibilities
//! - `TransactionInfos`: the clusters known at startup, shared by workers
//! - `ThreadLocalTransactionInfo`: per worker and cluster, transaction id
//!   -> (callbacks, connection) and host key -> connection
//! - Periodic audit of stale entries
//!
//! # Design Decisions
//! - At most one live `UpstreamConnection` per (cluster, host) per worker
//! - Deletion is lazy: `on_destroy` marks, the audit removes
//! - Callbacks run only after the table borrow is released

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::router::filter::DecoderFilterCallbacks;
use crate::router::upstream::{ConnectionState, UpstreamConnection};

/// Cluster-level descriptor shared across workers.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    cluster_name: String,
    transaction_timeout: Duration,
}

impl TransactionInfo {
    pub fn new(cluster_name: impl Into<String>, transaction_timeout: Duration) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            transaction_timeout,
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Idle lifetime after which the audit resets a transaction.
    pub fn transaction_timeout(&self) -> Duration {
        self.transaction_timeout
    }
}

/// Cluster name -> descriptor, populated once at startup.
#[derive(Debug, Clone, Default)]
pub struct TransactionInfos {
    infos: Arc<DashMap<String, Arc<TransactionInfo>>>,
}

impl TransactionInfos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cluster. Replaces an earlier entry of the same name.
    pub fn insert(&self, info: TransactionInfo) {
        self.infos.insert(info.cluster_name.clone(), Arc::new(info));
    }

    pub fn get(&self, cluster_name: &str) -> Option<Arc<TransactionInfo>> {
        self.infos.get(cluster_name).map(|info| info.clone())
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Fresh per-worker tables for every known cluster.
    pub fn thread_local(&self) -> ThreadLocalTransactionInfos {
        let clusters = self
            .infos
            .iter()
            .map(|entry| {
                let info = entry.value();
                (
                    info.cluster_name.clone(),
                    Rc::new(ThreadLocalTransactionInfo::new(
                        info.cluster_name.clone(),
                        info.transaction_timeout,
                    )),
                )
            })
            .collect();
        ThreadLocalTransactionInfos { clusters }
    }
}

/// A transaction's downstream callbacks and the connection it uses.
pub struct TransactionInfoItem {
    callbacks: Rc<dyn DecoderFilterCallbacks>,
    upstream_connection: Rc<UpstreamConnection>,
    timestamp: Instant,
    deleted: bool,
}

impl TransactionInfoItem {
    /// Stamped with the current time; the audit measures expiry from it.
    pub fn new(callbacks: Rc<dyn DecoderFilterCallbacks>, upstream_connection: Rc<UpstreamConnection>) -> Self {
        Self {
            callbacks,
            upstream_connection,
            timestamp: Instant::now(),
            deleted: false,
        }
    }

    pub fn callbacks(&self) -> Rc<dyn DecoderFilterCallbacks> {
        self.callbacks.clone()
    }

    pub fn upstream_connection(&self) -> Rc<UpstreamConnection> {
        self.upstream_connection.clone()
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn deleted(&self) -> bool {
        self.deleted
    }

    /// Flag for removal at the next audit.
    pub fn to_delete(&mut self) {
        self.deleted = true;
    }
}

/// One worker's transactions and upstream connections for one cluster.
///
/// Transactions are keyed by Via branch, connections by host key (IP).
pub struct ThreadLocalTransactionInfo {
    cluster_name: String,
    transaction_timeout: Duration,
    transactions: RefCell<HashMap<String, TransactionInfoItem>>,
    upstream_connections: RefCell<HashMap<String, Rc<UpstreamConnection>>>,
}

impl ThreadLocalTransactionInfo {
    pub fn new(cluster_name: impl Into<String>, transaction_timeout: Duration) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            transaction_timeout,
            transactions: RefCell::new(HashMap::new()),
            upstream_connections: RefCell::new(HashMap::new()),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Register a transaction, replacing a previous item for the same id.
    pub fn insert_transaction(&self, transaction_id: impl Into<String>, item: TransactionInfoItem) {
        self.transactions.borrow_mut().insert(transaction_id.into(), item);
    }

    /// True for deleted items too, until the audit removes them.
    pub fn has_transaction(&self, transaction_id: &str) -> bool {
        self.transactions.borrow().contains_key(transaction_id)
    }

    /// Callbacks of a live (not deleted) transaction.
    pub fn transaction_callbacks(&self, transaction_id: &str) -> Option<Rc<dyn DecoderFilterCallbacks>> {
        self.transactions
            .borrow()
            .get(transaction_id)
            .filter(|item| !item.deleted)
            .map(TransactionInfoItem::callbacks)
    }

    /// Mark deleted. Responses for it are dropped from now on.
    pub fn delete_transaction(&self, transaction_id: &str) {
        if let Some(item) = self.transactions.borrow_mut().get_mut(transaction_id) {
            item.to_delete();
        }
    }

    /// Items in the table, deleted ones included.
    pub fn transaction_count(&self) -> usize {
        self.transactions.borrow().len()
    }

    /// Connection to `host_key`, in whatever state it is.
    pub fn get_upstream_connection(&self, host_key: &str) -> Option<Rc<UpstreamConnection>> {
        self.upstream_connections.borrow().get(host_key).cloned()
    }

    /// Store a connection, replacing a stale one for the same host.
    pub fn insert_upstream_connection(&self, host_key: impl Into<String>, connection: Rc<UpstreamConnection>) {
        self.upstream_connections.borrow_mut().insert(host_key.into(), connection);
    }

    pub fn upstream_connection_count(&self) -> usize {
        self.upstream_connections.borrow().len()
    }

    /// Remove deleted items, reset and remove expired ones, then drop
    /// connections that are down and no longer used by any item.
    pub fn audit_timer_action(&self, now: Instant) {
        let mut expired = Vec::new();
        {
            let mut transactions = self.transactions.borrow_mut();
            transactions.retain(|transaction_id, item| {
                if item.deleted {
                    return false;
                }
                if now.saturating_duration_since(item.timestamp) > self.transaction_timeout {
                    expired.push((transaction_id.clone(), item.callbacks.clone()));
                    return false;
                }
                true
            });

            let mut connections = self.upstream_connections.borrow_mut();
            connections.retain(|_, connection| {
                let alive = matches!(
                    connection.state(),
                    ConnectionState::Connecting | ConnectionState::Connected
                );
                alive
                    || transactions
                        .values()
                        .any(|item| Rc::ptr_eq(&item.upstream_connection, connection))
            });
        }

        for (transaction_id, callbacks) in expired {
            tracing::debug!(
                cluster = %self.cluster_name,
                transaction_id = %transaction_id,
                "Transaction timed out"
            );
            callbacks.on_reset();
        }
    }
}

/// Per-worker tables, one per cluster.
#[derive(Default)]
pub struct ThreadLocalTransactionInfos {
    clusters: HashMap<String, Rc<ThreadLocalTransactionInfo>>,
}

impl ThreadLocalTransactionInfos {
    /// Table for `cluster_name`; `None` for clusters unknown at startup.
    pub fn get(&self, cluster_name: &str) -> Option<Rc<ThreadLocalTransactionInfo>> {
        self.clusters.get(cluster_name).cloned()
    }

    pub fn insert(&mut self, info: Rc<ThreadLocalTransactionInfo>) {
        self.clusters.insert(info.cluster_name.clone(), info);
    }

    /// Audit every cluster's table.
    pub fn audit_timer_action(&self, now: Instant) {
        for info in self.clusters.values() {
            info.audit_timer_action(now);
        }
    }
}
