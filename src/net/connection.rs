//! Downstream connection identity and drain accounting.
//!
//! # Responsibilities
//! - Mint downstream connection ids (`<remote>@<uuid>`)
//! - Count open downstream connections across workers
//! - Let shutdown wait for that count to reach zero

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::observability::metrics;

/// Id under which a downstream connection is registered and stamped into
/// `X-Envoy-Origin-Ingress`. Unique even when a peer reconnects from the
/// same address.
pub fn downstream_connection_id(remote: SocketAddr) -> String {
    format!("{}@{}", remote, Uuid::new_v4())
}

/// Open downstream connections, shared by all workers.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    open: Arc<watch::Sender<u64>>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self {
            open: Arc::new(watch::Sender::new(0)),
        }
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `remote` as open until the returned guard drops.
    pub fn track(&self, remote: impl Into<String>) -> ConnectionGuard {
        self.open.send_modify(|open| *open += 1);
        metrics::downstream_connection_opened();
        ConnectionGuard {
            open: self.open.clone(),
            remote: remote.into(),
        }
    }

    pub fn active_count(&self) -> u64 {
        *self.open.borrow()
    }

    /// Wait for every connection to close. False if `deadline` passed first.
    pub async fn wait_for_drain(&self, deadline: Duration) -> bool {
        let mut open = self.open.subscribe();
        let drained = tokio::time::timeout(deadline, open.wait_for(|open| *open == 0))
            .await
            .is_ok_and(|changed| changed.is_ok());
        drained
    }
}

#[derive(Debug)]
pub struct ConnectionGuard {
    open: Arc<watch::Sender<u64>>,
    remote: String,
}

impl ConnectionGuard {
    pub fn remote(&self) -> &str {
        &self.remote
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.open.send_modify(|open| *open = open.saturating_sub(1));
        metrics::downstream_connection_closed();
        tracing::trace!(remote = %self.remote, "Downstream connection released");
    }
}
