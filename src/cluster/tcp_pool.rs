//! Tokio TCP connection pool for one upstream host.
//!
//! # Responsibilities
//! - Enforce the per-host connection limit (Overflow)
//! - Connect with a deadline on the worker's `LocalSet`
//! - Expose the socket as an `UpstreamTransport`: writes go through an
//!   unbounded channel to a writer task, reads are pushed to callbacks
//!
//! # Design Decisions
//! - Every `new_connection` opens a fresh socket; reuse is the router's
//!   job (one live connection per host per worker)
//! - The host connection guard lives in the reader task and is released
//!   when the socket is gone

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

use crate::cluster::{
    ConnectionEvent, PoolCallbacks, PoolFailureReason, PoolHandle, TcpConnPool,
    UpstreamCallbacks, UpstreamTransport,
};
use crate::load_balancer::host::{Host, HostConnectionGuard};
use crate::observability::metrics;

const READ_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug)]
pub struct TokioTcpConnPool {
    host: Arc<Host>,
    connect_timeout: Duration,
}

impl TokioTcpConnPool {
    pub fn new(host: Arc<Host>, connect_timeout: Duration) -> Self {
        Self {
            host,
            connect_timeout,
        }
    }
}

impl TcpConnPool for TokioTcpConnPool {
    fn host(&self) -> Option<Arc<Host>> {
        Some(self.host.clone())
    }

    fn new_connection(&self, callbacks: Rc<dyn PoolCallbacks>) -> Result<PoolHandle, PoolFailureReason> {
        let Some(guard) = self.host.try_create_guard() else {
            tracing::warn!(
                host = %self.host.addr,
                max_connections = self.host.max_connections,
                "Upstream connection limit reached"
            );
            return Err(PoolFailureReason::Overflow);
        };

        let host = self.host.clone();
        let connect_timeout = self.connect_timeout;
        tokio::task::spawn_local(async move {
            match tokio::time::timeout(connect_timeout, TcpStream::connect(host.addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(host = %host.addr, "Upstream connection established");
                    let transport: Rc<dyn UpstreamTransport> = TcpTransport::spawn(stream, guard);
                    callbacks.on_pool_ready(transport, host);
                }
                Ok(Err(e)) => {
                    tracing::debug!(host = %host.addr, error = %e, "Upstream connect failed");
                    drop(guard);
                    callbacks.on_pool_failure(PoolFailureReason::RemoteConnectionFailure, Some(host));
                }
                Err(_) => {
                    tracing::debug!(host = %host.addr, "Upstream connect timed out");
                    drop(guard);
                    callbacks.on_pool_failure(PoolFailureReason::Timeout, Some(host));
                }
            }
        });

        Ok(PoolHandle::Pending)
    }
}

/// Socket halves driven by two local tasks.
pub struct TcpTransport {
    tx: RefCell<Option<mpsc::UnboundedSender<Bytes>>>,
    open: Rc<Cell<bool>>,
    callbacks: Rc<RefCell<Option<Weak<dyn UpstreamCallbacks>>>>,
    closed: Rc<Notify>,
}

impl TcpTransport {
    pub fn spawn(stream: TcpStream, guard: HostConnectionGuard) -> Rc<Self> {
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let open = Rc::new(Cell::new(true));
        let callbacks: Rc<RefCell<Option<Weak<dyn UpstreamCallbacks>>>> = Rc::new(RefCell::new(None));
        let closed = Rc::new(Notify::new());

        metrics::upstream_connection_opened();

        tokio::task::spawn_local(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = writer.write_all(&data).await {
                    tracing::debug!(error = %e, "Upstream write failed");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        {
            let open = open.clone();
            let callbacks = callbacks.clone();
            let closed = closed.clone();
            tokio::task::spawn_local(async move {
                let _guard = guard;
                let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
                let event = loop {
                    buf.clear();
                    tokio::select! {
                        read = reader.read_buf(&mut buf) => match read {
                            Ok(0) => break Some(ConnectionEvent::RemoteClose),
                            Ok(_) => {
                                let target = callbacks.borrow().as_ref().and_then(Weak::upgrade);
                                if let Some(target) = target {
                                    target.on_upstream_data(&buf);
                                }
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "Upstream read failed");
                                break Some(ConnectionEvent::RemoteClose);
                            }
                        },
                        _ = closed.notified() => break None,
                    }
                };

                open.set(false);
                metrics::upstream_connection_closed();
                if let Some(event) = event {
                    let target = callbacks.borrow().as_ref().and_then(Weak::upgrade);
                    if let Some(target) = target {
                        target.on_event(event);
                    }
                }
            });
        }

        Rc::new(Self {
            tx: RefCell::new(Some(tx)),
            open,
            callbacks,
            closed,
        })
    }
}

impl UpstreamTransport for TcpTransport {
    fn write(&self, data: Bytes) {
        if let Some(tx) = self.tx.borrow().as_ref() {
            let _ = tx.send(data);
        }
    }

    fn close(&self) {
        if self.open.replace(false) {
            // Dropping the sender lets the writer flush and shut down.
            self.tx.borrow_mut().take();
            self.closed.notify_one();
        }
    }

    fn is_open(&self) -> bool {
        self.open.get()
    }

    fn set_upstream_callbacks(&self, callbacks: Weak<dyn UpstreamCallbacks>) {
        *self.callbacks.borrow_mut() = Some(callbacks);
    }
}
