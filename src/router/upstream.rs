//! One pooled connection to an upstream host.
//!
//! # Responsibilities
//! - Request a connection from the pool and track its state
//! - Buffer writes until the connection is up, then flush in order
//! - Frame and decode upstream bytes; responses go to the transaction's
//!   callbacks, requests to `handle_upstream_request`
//! - Local error replies and reset classification
//!
//! # Data Flow
//! ```text
//! start() → pool.new_connection(self)
//!     → on_pool_ready: bind transport, flush, continue_handling(host, false)
//!     → on_pool_failure: NotConnected, continue_handling(host, true)
//! transport bytes → on_upstream_data → frame/decode → dispatch
//! ```

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::cluster::{
    ClusterInfo, ConnectionEvent, PoolCallbacks, PoolFailureReason, PoolHandle, TcpConnPool,
    UpstreamCallbacks, UpstreamTransport,
};
use crate::error::{ErrorCode, RouterError, RouterResult};
use crate::load_balancer::host::Host;
use crate::router::filter::DecoderFilterCallbacks;
use crate::router::stats::RouterStats;
use crate::router::transaction::ThreadLocalTransactionInfo;
use crate::router::ResponseStatus;
use crate::sip::{decoder, reply, MessageMetadata, MsgType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
    Closed,
}

pub struct UpstreamConnection {
    weak_self: Weak<UpstreamConnection>,
    pool: Rc<dyn TcpConnPool>,
    host: Arc<Host>,
    host_key: String,
    cluster_info: Arc<ClusterInfo>,
    /// The table that owns this connection; weak so the two can drop.
    transaction_info: Weak<ThreadLocalTransactionInfo>,
    /// Callbacks of the transaction that opened the connection.
    callbacks: Rc<dyn DecoderFilterCallbacks>,
    stats: Arc<RouterStats>,
    state: Cell<ConnectionState>,
    transport: RefCell<Option<Rc<dyn UpstreamTransport>>>,
    write_buffer: RefCell<Vec<Bytes>>,
    read_buffer: RefCell<BytesMut>,
}

impl UpstreamConnection {
    pub fn new(
        pool: Rc<dyn TcpConnPool>,
        host: Arc<Host>,
        cluster_info: Arc<ClusterInfo>,
        transaction_info: &Rc<ThreadLocalTransactionInfo>,
        callbacks: Rc<dyn DecoderFilterCallbacks>,
        stats: Arc<RouterStats>,
    ) -> Rc<Self> {
        let host_key = host.key().to_string();
        Rc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            pool,
            host,
            host_key,
            cluster_info,
            transaction_info: Rc::downgrade(transaction_info),
            callbacks,
            stats,
            state: Cell::new(ConnectionState::NotConnected),
            transport: RefCell::new(None),
            write_buffer: RefCell::new(Vec::new()),
            read_buffer: RefCell::new(BytesMut::new()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn host_key(&self) -> &str {
        &self.host_key
    }

    pub fn cluster_info(&self) -> &Arc<ClusterInfo> {
        &self.cluster_info
    }

    pub(crate) fn callbacks(&self) -> &Rc<dyn DecoderFilterCallbacks> {
        &self.callbacks
    }

    pub(crate) fn stats(&self) -> &Arc<RouterStats> {
        &self.stats
    }

    /// Ask the pool for a connection. `Ready` means the connection is
    /// already usable.
    pub fn start(&self) -> Result<PoolHandle, PoolFailureReason> {
        let Some(this) = self.weak_self.upgrade() else {
            return Err(PoolFailureReason::LocalConnectionFailure);
        };
        self.state.set(ConnectionState::Connecting);
        tracing::debug!(host = %self.host_key, cluster = %self.cluster_info.name, "Creating upstream connection");

        let result = self.pool.new_connection(this);
        if let Err(reason) = result {
            self.state.set(ConnectionState::NotConnected);
            if reason != PoolFailureReason::Overflow {
                self.host.mark_failure(self.cluster_info.unhealthy_threshold);
            }
        }
        result
    }

    /// Send bytes upstream, buffering while the connection is coming up.
    pub fn write(&self, data: Bytes) {
        if self.state.get() == ConnectionState::Connected {
            if let Some(transport) = self.transport.borrow().as_ref() {
                transport.write(data);
                return;
            }
        }
        self.write_buffer.borrow_mut().push(data);
    }

    pub fn buffered(&self) -> usize {
        self.write_buffer.borrow().len()
    }

    /// Overflow is fatal for the transaction; other reasons leave it to
    /// retry or expire.
    pub fn on_reset_stream(&self, reason: PoolFailureReason) -> RouterResult<()> {
        match reason {
            PoolFailureReason::Overflow => {
                tracing::warn!(host = %self.host_key, "Upstream connection overflow");
                Err(RouterError::Overflow(self.host_key.clone()))
            }
            PoolFailureReason::LocalConnectionFailure
            | PoolFailureReason::RemoteConnectionFailure
            | PoolFailureReason::Timeout => {
                tracing::debug!(host = %self.host_key, reason = ?reason, "Upstream connection reset");
                Ok(())
            }
        }
    }

    /// Answer `metadata` on this connection with a locally built error.
    /// Dropped when the connection is no longer open.
    pub fn on_error(&self, metadata: &MessageMetadata, code: ErrorCode, reason: &str) {
        let transport = self.transport.borrow().clone();
        match transport {
            Some(transport) if transport.is_open() => {
                transport.write(reply::encode_local_reply(metadata, code, reason));
                self.stats.inc(crate::router::stats::LOCAL_GENERATED_RESPONSE);
            }
            _ => {
                tracing::debug!(host = %self.host_key, "Connection closed, local reply dropped");
            }
        }
    }

    /// Detach from the transport, closing it when `close` is set.
    pub fn release_connection(&self, close: bool) {
        let transport = self.transport.borrow_mut().take();
        self.state.set(ConnectionState::Closed);
        if close {
            if let Some(transport) = transport {
                transport.close();
            }
        }
    }

    fn dispatch(&self, metadata: MessageMetadata) {
        match metadata.msg_type() {
            MsgType::Response => self.handle_upstream_response(metadata),
            MsgType::Request => self.handle_upstream_request(metadata),
        }
    }

    fn handle_upstream_response(&self, metadata: MessageMetadata) {
        let Some(transaction_id) = metadata.transaction_id().map(str::to_string) else {
            return;
        };
        let callbacks = self
            .transaction_info
            .upgrade()
            .and_then(|info| info.transaction_callbacks(&transaction_id));
        let Some(callbacks) = callbacks else {
            tracing::debug!(
                transaction_id = %transaction_id,
                host = %self.host_key,
                "No transaction for upstream response, dropping"
            );
            return;
        };

        if callbacks.upstream_data(metadata.into_ref(), None, None) == ResponseStatus::Reset {
            tracing::debug!(transaction_id = %transaction_id, "Downstream reset while delivering response");
        }
    }
}

impl PoolCallbacks for UpstreamConnection {
    fn on_pool_ready(&self, transport: Rc<dyn UpstreamTransport>, host: Arc<Host>) {
        tracing::debug!(host = %host.addr, "Upstream connection ready");
        let callbacks: Weak<dyn UpstreamCallbacks> = self.weak_self.clone();
        transport.set_upstream_callbacks(callbacks);

        let buffered: Vec<Bytes> = self.write_buffer.borrow_mut().drain(..).collect();
        for data in buffered {
            transport.write(data);
        }
        *self.transport.borrow_mut() = Some(transport);
        self.state.set(ConnectionState::Connected);

        if self.host.mark_success(self.cluster_info.healthy_threshold) {
            tracing::info!(host = %self.host.addr, "Upstream host healthy");
        }
        self.callbacks.continue_handling(&self.host_key, false);
    }

    fn on_pool_failure(&self, reason: PoolFailureReason, host: Option<Arc<Host>>) {
        let addr = host.as_ref().map(|h| h.addr.to_string()).unwrap_or_default();
        tracing::warn!(host = %addr, reason = ?reason, "Upstream connection failed");

        self.state.set(ConnectionState::NotConnected);
        self.write_buffer.borrow_mut().clear();
        if reason != PoolFailureReason::Overflow
            && self.host.mark_failure(self.cluster_info.unhealthy_threshold)
        {
            tracing::warn!(host = %self.host.addr, "Upstream host marked unhealthy");
        }
        let _ = self.on_reset_stream(reason);
        self.callbacks.continue_handling(&self.host_key, true);
    }
}

impl UpstreamCallbacks for UpstreamConnection {
    fn on_upstream_data(&self, data: &[u8]) {
        let mut messages = Vec::new();
        let mut failed = false;
        {
            let mut buffer = self.read_buffer.borrow_mut();
            buffer.extend_from_slice(data);
            loop {
                match decoder::frame(&mut buffer) {
                    Ok(Some(raw)) => messages.push(raw),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(host = %self.host_key, error = %e, "Invalid upstream message, closing");
                        buffer.clear();
                        failed = true;
                        break;
                    }
                }
            }
        }

        for raw in messages {
            match decoder::decode(raw) {
                Ok(metadata) => self.dispatch(metadata),
                Err(e) => tracing::warn!(host = %self.host_key, error = %e, "Dropping undecodable upstream message"),
            }
        }

        if failed {
            self.release_connection(true);
        }
    }

    fn on_event(&self, event: ConnectionEvent) {
        tracing::debug!(host = %self.host_key, event = ?event, "Upstream connection closed");
        self.release_connection(false);
    }
}
