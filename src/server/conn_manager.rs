//! Downstream connection manager.
//!
//! # Responsibilities
//! - Frame and decode SIP from one downstream TCP connection
//! - Own one `Router` per transaction id and drive it through the filter
//!   stages
//! - Turn routing errors into local replies
//! - Resume paused transactions from `ConnEvent`s posted by upstream
//!   connections and the TRA handler
//! - Forward requests initiated upstream to the client and route the
//!   client's responses back to the exact upstream host
//!
//! # Data Flow
//! ```text
//! socket bytes → on_data → frame/decode → on_message
//!     request  → ActiveTrans (new or existing) → Router stages
//!     response → UpstreamActiveTrans? → fresh Router, destination = return host
//! ConnEvent (mpsc, same worker)
//!     Resume{id, action} → adjust metadata → Router from message_begin
//!     Reset{id}          → destroy the transaction
//!     UpstreamRequest    → write to client, remember return destination
//! ```
//!
//! # Design Decisions
//! - Callbacks handed to routers never touch the manager directly; they
//!   write to the socket channel or post an event, so no router code is
//!   re-entered while the manager is borrowed

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

use crate::error::{RouterError, RouterResult};
use crate::net::connection::downstream_connection_id;
use crate::router::downstream::DownstreamConnectionInfos;
use crate::router::stats::{DOWNSTREAM_RESPONSE_ERROR, LOCAL_GENERATED_RESPONSE};
use crate::router::transaction::ThreadLocalTransactionInfos;
use crate::router::{
    DecoderFilterCallbacks, FilterStatus, OriginIngress, ResponseStatus, ResumeAction, ResumeSink, Router,
    CONNECTION_PENDING,
};
use crate::routing::RouteEntry;
use crate::server::worker::WorkerContext;
use crate::sip::{decoder, encoder, reply, MessageMetadata, MessageMetadataRef, MethodType, MsgType};
use crate::tra::TraHandler;

/// Work posted to a connection from elsewhere on its worker.
#[derive(Debug)]
pub enum ConnEvent {
    /// A paused transaction may continue.
    Resume {
        transaction_id: String,
        action: ResumeAction,
    },
    /// A transaction expired in the transaction audit.
    Reset { transaction_id: String },
    /// A request initiated by an upstream host, addressed to this client.
    UpstreamRequest {
        metadata: MessageMetadataRef,
        route: Option<Arc<RouteEntry>>,
        return_destination: Option<String>,
    },
}

/// Write side and event side of one downstream connection.
pub struct DownstreamChannel {
    writer: RefCell<Option<mpsc::UnboundedSender<Bytes>>>,
    events: RefCell<Option<mpsc::UnboundedSender<ConnEvent>>>,
}

impl DownstreamChannel {
    pub fn new(writer: mpsc::UnboundedSender<Bytes>, events: mpsc::UnboundedSender<ConnEvent>) -> Self {
        Self {
            writer: RefCell::new(Some(writer)),
            events: RefCell::new(Some(events)),
        }
    }

    /// Queue bytes for the client. False once the connection is closed.
    pub fn write(&self, data: Bytes) -> bool {
        self.writer
            .borrow()
            .as_ref()
            .is_some_and(|writer| writer.send(data).is_ok())
    }

    pub fn post(&self, event: ConnEvent) -> bool {
        self.events
            .borrow()
            .as_ref()
            .is_some_and(|events| events.send(event).is_ok())
    }

    pub fn is_open(&self) -> bool {
        self.writer.borrow().is_some()
    }

    /// Drop both senders; the writer task exits once its queue drains.
    pub fn close(&self) {
        self.writer.borrow_mut().take();
        self.events.borrow_mut().take();
    }
}

impl ResumeSink for DownstreamChannel {
    fn resume(&self, transaction_id: &str, action: ResumeAction) {
        let posted = self.post(ConnEvent::Resume {
            transaction_id: transaction_id.to_string(),
            action,
        });
        if !posted {
            tracing::debug!(transaction_id = %transaction_id, "Connection closed, resume dropped");
        }
    }
}

/// The callbacks a downstream transaction's router sees.
pub struct TransactionCallbacks {
    transaction_id: String,
    route: Option<Arc<RouteEntry>>,
    origin: OriginIngress,
    ctx: Rc<WorkerContext>,
    channel: Rc<DownstreamChannel>,
}

impl DecoderFilterCallbacks for TransactionCallbacks {
    fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    fn route(&self) -> Option<Arc<RouteEntry>> {
        self.route.clone()
    }

    fn origin_ingress(&self) -> Option<OriginIngress> {
        Some(self.origin.clone())
    }

    fn transaction_infos(&self) -> Rc<ThreadLocalTransactionInfos> {
        self.ctx.transaction_infos.clone()
    }

    fn downstream_connection_infos(&self) -> Rc<DownstreamConnectionInfos> {
        self.ctx.downstream_connection_infos.clone()
    }

    fn tra_handler(&self) -> Option<Rc<TraHandler>> {
        self.ctx.tra_handler.clone()
    }

    fn upstream_data(
        &self,
        metadata: MessageMetadataRef,
        _route: Option<Arc<RouteEntry>>,
        _return_destination: Option<String>,
    ) -> ResponseStatus {
        let data = encoder::encode(&metadata.borrow());
        if self.channel.write(data) {
            ResponseStatus::Complete
        } else {
            ResponseStatus::Reset
        }
    }

    fn push_into_pending_list(&self, kind: &str, key: &str) {
        self.ctx
            .pending
            .push(kind, key, &self.transaction_id, self.channel.clone());
    }

    fn continue_handling(&self, key: &str, try_next_affinity: bool) {
        let action = if try_next_affinity {
            ResumeAction::NextAffinity {
                fail_when_exhausted: true,
            }
        } else {
            ResumeAction::Retry
        };
        self.ctx.pending.resume(CONNECTION_PENDING, key, action);
    }

    fn on_reset(&self) {
        self.channel.post(ConnEvent::Reset {
            transaction_id: self.transaction_id.clone(),
        });
    }
}

/// The connection-level entry registered in `DownstreamConnectionInfos`.
struct DownstreamConnection {
    id: String,
    origin: OriginIngress,
    ctx: Rc<WorkerContext>,
    channel: Rc<DownstreamChannel>,
}

impl DecoderFilterCallbacks for DownstreamConnection {
    fn transaction_id(&self) -> &str {
        &self.id
    }

    fn route(&self) -> Option<Arc<RouteEntry>> {
        None
    }

    fn origin_ingress(&self) -> Option<OriginIngress> {
        Some(self.origin.clone())
    }

    fn transaction_infos(&self) -> Rc<ThreadLocalTransactionInfos> {
        self.ctx.transaction_infos.clone()
    }

    fn downstream_connection_infos(&self) -> Rc<DownstreamConnectionInfos> {
        self.ctx.downstream_connection_infos.clone()
    }

    fn upstream_data(
        &self,
        metadata: MessageMetadataRef,
        route: Option<Arc<RouteEntry>>,
        return_destination: Option<String>,
    ) -> ResponseStatus {
        let posted = self.channel.post(ConnEvent::UpstreamRequest {
            metadata,
            route,
            return_destination,
        });
        if posted {
            ResponseStatus::Complete
        } else {
            ResponseStatus::Reset
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    TransportBegin,
    MessageBegin,
}

struct ActiveTrans {
    router: Router,
    metadata: MessageMetadataRef,
    created: Instant,
}

/// A request an upstream host sent to this client, awaiting the client's
/// final response.
struct UpstreamActiveTrans {
    route: Option<Arc<RouteEntry>>,
    return_destination: String,
    created: Instant,
}

pub struct ConnectionManager {
    ctx: Rc<WorkerContext>,
    id: String,
    origin: OriginIngress,
    channel: Rc<DownstreamChannel>,
    transactions: HashMap<String, ActiveTrans>,
    upstream_transactions: HashMap<String, UpstreamActiveTrans>,
}

impl ConnectionManager {
    /// Register a new downstream connection on this worker.
    pub fn new(
        ctx: Rc<WorkerContext>,
        remote: SocketAddr,
        writer: mpsc::UnboundedSender<Bytes>,
        events: mpsc::UnboundedSender<ConnEvent>,
    ) -> Self {
        let id = downstream_connection_id(remote);
        let origin = OriginIngress::new(ctx.thread_id.clone(), id.clone());
        let channel = Rc::new(DownstreamChannel::new(writer, events));

        ctx.downstream_connection_infos.insert(
            id.clone(),
            Rc::new(DownstreamConnection {
                id: id.clone(),
                origin: origin.clone(),
                ctx: ctx.clone(),
                channel: channel.clone(),
            }),
        );
        tracing::debug!(connection_id = %id, worker = %ctx.thread_id, "Downstream connection registered");

        Self {
            ctx,
            id,
            origin,
            channel,
            transactions: HashMap::new(),
            upstream_transactions: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn upstream_transaction_count(&self) -> usize {
        self.upstream_transactions.len()
    }

    /// Consume every complete message in `buffer`. Returns false when the
    /// stream is unusable and the connection must close.
    pub fn on_data(&mut self, buffer: &mut BytesMut) -> bool {
        loop {
            match decoder::frame(buffer) {
                Ok(Some(raw)) => match decoder::decode(raw) {
                    Ok(metadata) => self.on_message(metadata),
                    Err(e) => {
                        tracing::debug!(connection_id = %self.id, error = %e, "Dropping undecodable message");
                    }
                },
                Ok(None) => return true,
                Err(e) => {
                    tracing::warn!(connection_id = %self.id, error = %e, "Invalid downstream stream, closing");
                    return false;
                }
            }
        }
    }

    pub fn on_message(&mut self, metadata: MessageMetadata) {
        let Some(transaction_id) = metadata.transaction_id().map(str::to_string) else {
            return;
        };
        match metadata.msg_type() {
            MsgType::Request => self.on_request(transaction_id, metadata),
            MsgType::Response => self.on_response(transaction_id, metadata),
        }
    }

    fn on_request(&mut self, transaction_id: String, metadata: MessageMetadata) {
        tracing::debug!(
            connection_id = %self.id,
            transaction_id = %transaction_id,
            method = metadata.method_type().as_str(),
            "Downstream request"
        );

        if let Some(trans) = self.transactions.get_mut(&transaction_id) {
            trans.metadata = metadata.into_ref();
        } else {
            let route = self.ctx.routes.load().route(&metadata);
            let callbacks = self.transaction_callbacks(&transaction_id, route);
            let router = Router::new(self.ctx.cluster_manager.clone(), self.ctx.stats.clone(), callbacks);
            self.transactions.insert(
                transaction_id.clone(),
                ActiveTrans {
                    router,
                    metadata: metadata.into_ref(),
                    created: Instant::now(),
                },
            );
        }

        self.drive(&transaction_id, Stage::TransportBegin);
    }

    fn on_response(&mut self, transaction_id: String, mut metadata: MessageMetadata) {
        let Some(upstream) = self.upstream_transactions.get(&transaction_id) else {
            tracing::debug!(
                connection_id = %self.id,
                transaction_id = %transaction_id,
                "No upstream transaction for downstream response, dropping"
            );
            return;
        };

        metadata.set_destination(upstream.return_destination.clone());
        let route = upstream
            .route
            .clone()
            .or_else(|| self.ctx.routes.load().route(&metadata));
        let is_final = metadata.status_code().is_some_and(|code| code >= 200);

        let callbacks = self.transaction_callbacks(&transaction_id, route);
        let mut router = Router::new(self.ctx.cluster_manager.clone(), self.ctx.stats.clone(), callbacks);
        let metadata = metadata.into_ref();
        match run_router(&mut router, &metadata, Stage::TransportBegin) {
            Ok(FilterStatus::Continue) => {}
            Ok(FilterStatus::StopIteration) => {
                tracing::debug!(transaction_id = %transaction_id, "Upstream host not connected, response dropped");
            }
            Err(e) => {
                tracing::warn!(transaction_id = %transaction_id, error = %e, "Failed to route response upstream");
            }
        }
        router.on_destroy();

        if is_final {
            self.upstream_transactions.remove(&transaction_id);
        }
    }

    fn transaction_callbacks(
        &self,
        transaction_id: &str,
        route: Option<Arc<RouteEntry>>,
    ) -> Rc<TransactionCallbacks> {
        Rc::new(TransactionCallbacks {
            transaction_id: transaction_id.to_string(),
            route,
            origin: self.origin.clone(),
            ctx: self.ctx.clone(),
            channel: self.channel.clone(),
        })
    }

    fn drive(&mut self, transaction_id: &str, stage: Stage) {
        let Some(trans) = self.transactions.get_mut(transaction_id) else {
            return;
        };
        let metadata = trans.metadata.clone();

        match run_router(&mut trans.router, &metadata, stage) {
            Ok(FilterStatus::Continue) => {
                tracing::trace!(transaction_id = %transaction_id, "Message forwarded");
            }
            Ok(FilterStatus::StopIteration) => {
                tracing::debug!(transaction_id = %transaction_id, "Transaction paused");
            }
            Err(e) => {
                self.destroy(transaction_id);
                self.send_local_reply(&metadata, &e);
            }
        }
    }

    /// Answer a downstream request with an error. ACK gets no answer.
    fn send_local_reply(&self, metadata: &MessageMetadataRef, error: &RouterError) {
        let md = metadata.borrow();
        if md.msg_type() != MsgType::Request || md.method_type() == MethodType::Ack {
            return;
        }

        let code = error.error_code();
        tracing::debug!(
            connection_id = %self.id,
            transaction_id = ?md.transaction_id(),
            status = code.status(),
            reason = %error,
            "Sending local reply"
        );
        self.ctx.stats.inc(DOWNSTREAM_RESPONSE_ERROR);
        if self.channel.write(reply::encode_local_reply(&md, code, &error.to_string())) {
            self.ctx.stats.inc(LOCAL_GENERATED_RESPONSE);
        }
    }

    fn destroy(&mut self, transaction_id: &str) {
        if let Some(mut trans) = self.transactions.remove(transaction_id) {
            trans.router.on_destroy();
        }
    }

    pub fn on_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Resume { transaction_id, action } => self.on_resume(&transaction_id, action),
            ConnEvent::Reset { transaction_id } => {
                tracing::debug!(connection_id = %self.id, transaction_id = %transaction_id, "Transaction reset");
                self.destroy(&transaction_id);
            }
            ConnEvent::UpstreamRequest {
                metadata,
                route,
                return_destination,
            } => self.on_upstream_request(metadata, route, return_destination),
        }
    }

    fn on_resume(&mut self, transaction_id: &str, action: ResumeAction) {
        let Some(trans) = self.transactions.get(transaction_id) else {
            tracing::debug!(transaction_id = %transaction_id, "Resumed transaction is gone");
            return;
        };

        match action {
            ResumeAction::Retry => {}
            ResumeAction::Resolved(host) => {
                trans.metadata.borrow_mut().set_destination(host);
            }
            ResumeAction::NextAffinity { fail_when_exhausted } => {
                let failed_key = trans
                    .router
                    .upstream_connection()
                    .map(|connection| connection.host_key().to_string())
                    .or_else(|| trans.metadata.borrow().destination().map(str::to_string))
                    .unwrap_or_default();

                let exhausted = {
                    let mut md = trans.metadata.borrow_mut();
                    md.reset_destination();
                    md.next_affinity_iteration();
                    md.affinity_exhausted()
                };

                if exhausted && fail_when_exhausted {
                    let metadata = trans.metadata.clone();
                    self.destroy(transaction_id);
                    self.send_local_reply(&metadata, &RouterError::ConnectionExhausted(failed_key));
                    return;
                }
            }
        }

        self.drive(transaction_id, Stage::MessageBegin);
    }

    fn on_upstream_request(
        &mut self,
        metadata: MessageMetadataRef,
        route: Option<Arc<RouteEntry>>,
        return_destination: Option<String>,
    ) {
        let (transaction_id, data) = {
            let md = metadata.borrow();
            (md.transaction_id().unwrap_or_default().to_string(), encoder::encode(&md))
        };
        if !self.channel.write(data) {
            tracing::debug!(transaction_id = %transaction_id, "Connection closed, upstream request dropped");
            return;
        }

        if let Some(return_destination) = return_destination {
            self.upstream_transactions.insert(
                transaction_id,
                UpstreamActiveTrans {
                    route,
                    return_destination,
                    created: Instant::now(),
                },
            );
        }
    }

    /// Drop transactions older than the transaction timeout.
    pub fn audit(&mut self, now: Instant) {
        let timeout = self.ctx.transaction_timeout();
        let expired: Vec<String> = self
            .transactions
            .iter()
            .filter(|(_, trans)| now.saturating_duration_since(trans.created) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for transaction_id in &expired {
            self.destroy(transaction_id);
        }
        self.upstream_transactions
            .retain(|_, trans| now.saturating_duration_since(trans.created) <= timeout);
    }

    /// Unregister and destroy every transaction.
    pub fn close(&mut self) {
        self.ctx.downstream_connection_infos.remove(&self.id);
        for (_, mut trans) in self.transactions.drain() {
            trans.router.on_destroy();
        }
        self.upstream_transactions.clear();
        self.channel.close();
        tracing::debug!(connection_id = %self.id, "Downstream connection closed");
    }
}

fn run_router(router: &mut Router, metadata: &MessageMetadataRef, stage: Stage) -> RouterResult<FilterStatus> {
    if stage == Stage::TransportBegin && router.transport_begin(metadata.clone())? == FilterStatus::StopIteration {
        return Ok(FilterStatus::StopIteration);
    }
    if router.message_begin(metadata.clone())? == FilterStatus::StopIteration {
        return Ok(FilterStatus::StopIteration);
    }
    router.message_end()?;
    router.transport_end()
}

/// Serve one accepted downstream connection until it closes or the
/// worker shuts down. Must run inside the worker's `LocalSet`.
pub async fn serve_connection(
    ctx: Rc<WorkerContext>,
    stream: TcpStream,
    remote: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<Bytes>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ConnEvent>();

    let writer_task = tokio::task::spawn_local(async move {
        while let Some(data) = write_rx.recv().await {
            if let Err(e) = writer.write_all(&data).await {
                tracing::debug!(error = %e, "Downstream write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut manager = ConnectionManager::new(ctx.clone(), remote, write_tx, event_tx);
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut audit = tokio::time::interval(ctx.audit_interval());

    loop {
        tokio::select! {
            read = reader.read_buf(&mut buffer) => match read {
                Ok(0) => break,
                Ok(_) => {
                    if !manager.on_data(&mut buffer) {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(connection_id = %manager.id(), error = %e, "Downstream read failed");
                    break;
                }
            },
            Some(event) = event_rx.recv() => manager.on_event(event),
            _ = audit.tick() => manager.audit(Instant::now()),
            _ = shutdown.recv() => break,
        }
    }

    manager.close();
    let _ = writer_task.await;
}
