//! Downstream SIP listener shared by every worker.
//!
//! # Responsibilities
//! - Bind the SIP TCP port once, before any worker starts
//! - Give each worker runtime its own accept handle over that socket
//! - Cap open downstream connections across all workers
//!
//! # Design Decisions
//! - The cap is one semaphore for the whole process. A worker waiting on
//!   a slot stops accepting, and the kernel backlog absorbs the burst

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ListenerConfig;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid bind address '{0}'")]
    Address(String),

    #[error("failed to bind: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to register socket with worker runtime: {0}")]
    Register(#[source] std::io::Error),

    #[error("failed to accept: {0}")]
    Accept(#[source] std::io::Error),

    #[error("connection limit closed")]
    Closed,
}

/// Bound SIP socket and the process-wide connection cap.
#[derive(Debug)]
pub struct SharedListener {
    socket: std::net::TcpListener,
    slots: Arc<Semaphore>,
}

impl SharedListener {
    pub fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|_| ListenerError::Address(config.bind_address.clone()))?;

        let socket = std::net::TcpListener::bind(addr).map_err(ListenerError::Bind)?;
        socket.set_nonblocking(true).map_err(ListenerError::Bind)?;
        let local = socket.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(
            address = %local,
            max_connections = config.max_connections,
            "SIP listener bound"
        );

        Ok(Self {
            socket,
            slots: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Accept handle for the calling worker. Must run inside that worker's
    /// runtime so the socket registers with its reactor.
    pub fn worker_listener(&self) -> Result<WorkerListener, ListenerError> {
        let socket = self.socket.try_clone().map_err(ListenerError::Register)?;
        let inner = TcpListener::from_std(socket).map_err(ListenerError::Register)?;
        Ok(WorkerListener {
            inner,
            slots: self.slots.clone(),
        })
    }
}

/// One worker's view of the shared socket.
pub struct WorkerListener {
    inner: TcpListener,
    slots: Arc<Semaphore>,
}

impl WorkerListener {
    /// Wait for a free slot, then for a downstream connection. The slot is
    /// held by the returned permit until the connection ends.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, remote) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(remote = %remote, error = %e, "Failed to set TCP_NODELAY");
        }

        tracing::debug!(
            remote = %remote,
            free_slots = self.slots.available_permits(),
            "Downstream connection accepted"
        );

        Ok((stream, remote, ConnectionPermit(permit)))
    }

    pub fn free_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

/// Connection slot; released on drop.
#[derive(Debug)]
pub struct ConnectionPermit(#[allow(dead_code)] OwnedSemaphorePermit);
