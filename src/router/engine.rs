//! Per-transaction router state machine.
//!
//! # Data Flow
//! ```text
//! transport_begin → route, cluster, maintenance check, affinity list
//! message_begin   → affinity walk → pool for destination → connection
//!                   Continue | StopIteration (connecting, TRA pending)
//! message_end     → pass-through
//! transport_end   → origin ingress rewrite → encode → write upstream
//! on_destroy      → mark the transaction item deleted
//! ```
//!
//! # Design Decisions
//! - A stopped transaction is re-driven from `message_begin` with the same
//!   metadata; the router keeps its connection across calls
//! - Every error increments its counter before it is returned

use std::rc::Rc;
use std::sync::Arc;

use crate::cluster::{ClusterInfo, ClusterManager, LoadBalancerContext, PoolHandle, ThreadLocalCluster};
use crate::error::{RouterError, RouterResult};
use crate::router::affinity;
use crate::router::filter::DecoderFilterCallbacks;
use crate::router::origin_ingress::ORIGIN_INGRESS_HEADER;
use crate::router::pending::CONNECTION_PENDING;
use crate::router::stats::{RouterStats, UPSTREAM_REQUEST, UPSTREAM_RESPONSE};
use crate::router::transaction::{ThreadLocalTransactionInfo, TransactionInfoItem};
use crate::router::upstream::{ConnectionState, UpstreamConnection};
use crate::router::{FilterStatus, QueryStatus};
use crate::routing::RouteEntry;
use crate::sip::{encoder, AffinityEntry, HeaderType, MessageMetadataRef, MsgType, Operation, SipHeader};

/// Outcome of one affinity candidate.
enum Resolution {
    Host(String),
    Pending,
    Skip,
}

/// Routing state machine for one downstream transaction.
///
/// Driven by the connection manager in stage order. A paused transaction is
/// re-driven from `message_begin` once its pending key resumes.
pub struct Router {
    cluster_manager: Rc<dyn ClusterManager>,
    stats: Arc<RouterStats>,
    callbacks: Rc<dyn DecoderFilterCallbacks>,
    metadata: Option<MessageMetadataRef>,
    route_entry: Option<Arc<RouteEntry>>,
    cluster: Option<Rc<dyn ThreadLocalCluster>>,
    cluster_info: Option<Arc<ClusterInfo>>,
    transaction_info: Option<Rc<ThreadLocalTransactionInfo>>,
    upstream_connection: Option<Rc<UpstreamConnection>>,
}

impl Router {
    /// A router with nothing resolved yet. The first call must be
    /// `transport_begin`.
    pub fn new(
        cluster_manager: Rc<dyn ClusterManager>,
        stats: Arc<RouterStats>,
        callbacks: Rc<dyn DecoderFilterCallbacks>,
    ) -> Self {
        Self {
            cluster_manager,
            stats,
            callbacks,
            metadata: None,
            route_entry: None,
            cluster: None,
            cluster_info: None,
            transaction_info: None,
            upstream_connection: None,
        }
    }

    /// Route matched in `transport_begin`.
    pub fn route_entry(&self) -> Option<&Arc<RouteEntry>> {
        self.route_entry.as_ref()
    }

    /// Connection the transaction is bound to, once `message_begin` picked one.
    pub fn upstream_connection(&self) -> Option<&Rc<UpstreamConnection>> {
        self.upstream_connection.as_ref()
    }

    fn fail(&self, error: RouterError) -> RouterError {
        self.stats.inc(error.stat_name());
        tracing::debug!(
            transaction_id = %self.callbacks.transaction_id(),
            error = %error,
            "Routing failed"
        );
        error
    }

    /// Resolve route, cluster and transaction table, then build the affinity
    /// list for requests.
    ///
    /// Fails with `RouteMissing`, `UnknownCluster` or `MaintenanceMode`;
    /// each bumps its counter before returning.
    pub fn transport_begin(&mut self, metadata: MessageMetadataRef) -> RouterResult<FilterStatus> {
        self.metadata = Some(metadata.clone());

        let route = self
            .callbacks
            .route()
            .ok_or_else(|| self.fail(RouterError::RouteMissing))?;
        let cluster_name = route.cluster_name().to_string();
        tracing::debug!(
            transaction_id = %self.callbacks.transaction_id(),
            route = %route.name(),
            cluster = %cluster_name,
            "Route matched"
        );

        let cluster = self
            .cluster_manager
            .get_thread_local_cluster(&cluster_name)
            .ok_or_else(|| self.fail(RouterError::UnknownCluster(cluster_name.clone())))?;
        let info = cluster.info();
        if info.maintenance_mode {
            return Err(self.fail(RouterError::MaintenanceMode(cluster_name)));
        }
        let transaction_info = self
            .callbacks
            .transaction_infos()
            .get(&cluster_name)
            .ok_or_else(|| self.fail(RouterError::UnknownCluster(cluster_name.clone())))?;

        if metadata.borrow().msg_type() == MsgType::Request {
            affinity::build_affinity(&mut metadata.borrow_mut(), &info.options);
            self.subscribe(&metadata.borrow().affinity().to_vec());
            self.publish_cookie_ip_map(&metadata);
        }

        self.route_entry = Some(route);
        self.cluster = Some(cluster);
        self.cluster_info = Some(info);
        self.transaction_info = Some(transaction_info);
        Ok(FilterStatus::Continue)
    }

    /// Share a `P-Nokia-Cookie-IP-Mapping` with other proxies as an
    /// `lskpmc` mapping.
    fn publish_cookie_ip_map(&self, metadata: &MessageMetadataRef) {
        let Some((cookie, ip)) = metadata
            .borrow()
            .p_cookie_ip_map()
            .map(|(cookie, ip)| (cookie.to_string(), ip.to_string()))
        else {
            return;
        };
        let Some(handler) = self.callbacks.tra_handler() else {
            return;
        };
        let context = handler.context(self.callbacks.transaction_id());
        handler.update("lskpmc", &cookie, &ip, context);
    }

    fn subscribe(&self, entries: &[AffinityEntry]) {
        if !entries.iter().any(|entry| entry.subscribe) {
            return;
        }
        let Some(handler) = self.callbacks.tra_handler() else {
            return;
        };
        for entry in entries.iter().filter(|entry| entry.subscribe) {
            handler.subscribe(&entry.affinity_type);
        }
    }

    /// Pick a destination and bind an upstream connection.
    ///
    /// Returns `StopIteration` when a TRA query or a connecting pool holds the
    /// transaction; it is parked on the pending list under that key.
    pub fn message_begin(&mut self, metadata: MessageMetadataRef) -> RouterResult<FilterStatus> {
        self.metadata = Some(metadata.clone());

        if let Some(connection) = self.upstream_connection.clone() {
            match connection.state() {
                ConnectionState::Connected => return Ok(FilterStatus::Continue),
                ConnectionState::Connecting => {
                    self.callbacks
                        .push_into_pending_list(CONNECTION_PENDING, connection.host_key());
                    return Ok(FilterStatus::StopIteration);
                }
                ConnectionState::NotConnected | ConnectionState::Closed => {
                    self.upstream_connection = None;
                }
            }
        }

        let (Some(cluster), Some(info), Some(transaction_info)) = (
            self.cluster.clone(),
            self.cluster_info.clone(),
            self.transaction_info.clone(),
        ) else {
            return Err(self.fail(RouterError::RouteMissing));
        };

        let (msg_type, has_destination) = {
            let md = metadata.borrow();
            (md.msg_type(), md.destination().is_some())
        };
        if msg_type == MsgType::Request && !has_destination {
            loop {
                let Some(entry) = metadata.borrow().affinity_iteration().cloned() else {
                    break;
                };
                match self.resolve(&metadata, &entry) {
                    Resolution::Host(host) => {
                        tracing::debug!(affinity = %entry.affinity_type, host = %host, "Affinity resolved");
                        metadata.borrow_mut().set_destination(host);
                        break;
                    }
                    Resolution::Pending => return Ok(FilterStatus::StopIteration),
                    Resolution::Skip => {
                        metadata.borrow_mut().next_affinity_iteration();
                    }
                }
            }

            let exhausted = {
                let md = metadata.borrow();
                md.destination().is_none() && md.stop_load_balance()
            };
            if exhausted {
                return Err(self.fail(RouterError::AffinityExhausted));
            }
        }

        let destination = metadata.borrow().destination().map(str::to_string);
        let context = LoadBalancerContext {
            destination: destination.as_deref(),
        };
        let pool = cluster
            .tcp_conn_pool(&context)
            .ok_or_else(|| self.fail(RouterError::NoHealthyUpstream(info.name.clone())))?;
        let host = pool
            .host()
            .ok_or_else(|| self.fail(RouterError::NoHealthyUpstream(info.name.clone())))?;
        let host_key = host.key().to_string();

        if let Some(connection) = transaction_info.get_upstream_connection(&host_key) {
            match connection.state() {
                ConnectionState::Connected => {
                    self.register(&transaction_info, connection);
                    return Ok(FilterStatus::Continue);
                }
                ConnectionState::Connecting => {
                    self.register(&transaction_info, connection);
                    self.callbacks.push_into_pending_list(CONNECTION_PENDING, &host_key);
                    return Ok(FilterStatus::StopIteration);
                }
                ConnectionState::NotConnected | ConnectionState::Closed => {}
            }
        }

        let connection = UpstreamConnection::new(
            pool,
            host,
            info,
            &transaction_info,
            self.callbacks.clone(),
            self.stats.clone(),
        );
        transaction_info.insert_upstream_connection(host_key.clone(), connection.clone());
        self.register(&transaction_info, connection.clone());

        match connection.start() {
            Ok(PoolHandle::Ready) => Ok(FilterStatus::Continue),
            Ok(PoolHandle::Pending) => {
                self.callbacks.push_into_pending_list(CONNECTION_PENDING, &host_key);
                Ok(FilterStatus::StopIteration)
            }
            Err(reason) => {
                connection.on_reset_stream(reason).map_err(|e| self.fail(e))?;
                self.callbacks.push_into_pending_list(CONNECTION_PENDING, &host_key);
                self.callbacks.continue_handling(&host_key, true);
                Ok(FilterStatus::StopIteration)
            }
        }
    }

    fn resolve(&self, metadata: &MessageMetadataRef, entry: &AffinityEntry) -> Resolution {
        if entry.is_ep() {
            return match affinity::resolve_ep(&metadata.borrow(), entry) {
                Some(host) => Resolution::Host(host),
                None => Resolution::Skip,
            };
        }

        let Some(handler) = self.callbacks.tra_handler() else {
            return Resolution::Skip;
        };
        match handler.retrieve(&entry.affinity_type, &entry.key, entry.query, self.callbacks.as_ref()) {
            (QueryStatus::Continue, Some(host)) => Resolution::Host(host),
            (QueryStatus::Pending, _) => Resolution::Pending,
            _ => Resolution::Skip,
        }
    }

    fn register(&mut self, transaction_info: &ThreadLocalTransactionInfo, connection: Rc<UpstreamConnection>) {
        transaction_info.insert_transaction(
            self.callbacks.transaction_id(),
            TransactionInfoItem::new(self.callbacks.clone(), connection.clone()),
        );
        self.upstream_connection = Some(connection);
    }

    /// No work at this stage.
    pub fn message_end(&mut self) -> RouterResult<FilterStatus> {
        Ok(FilterStatus::Continue)
    }

    /// Encode the message with its recorded edits and write it upstream.
    /// Requests on clusters with upstream transactions get a fresh
    /// `X-Envoy-Origin-Ingress` first.
    pub fn transport_end(&mut self) -> RouterResult<FilterStatus> {
        let (Some(metadata), Some(connection)) = (self.metadata.clone(), self.upstream_connection.clone()) else {
            return Ok(FilterStatus::Continue);
        };

        let msg_type = metadata.borrow().msg_type();
        let upstream_transactions = self
            .cluster_info
            .as_ref()
            .is_some_and(|info| info.options.upstream_transactions.enabled);
        if msg_type == MsgType::Request && upstream_transactions {
            self.stamp_origin_ingress(&metadata);
        }

        let data = encoder::encode(&metadata.borrow());
        connection.write(data);

        match msg_type {
            MsgType::Request => self.stats.inc(UPSTREAM_REQUEST),
            MsgType::Response => self.stats.inc(UPSTREAM_RESPONSE),
        }
        Ok(FilterStatus::Continue)
    }

    /// Replace any `X-Envoy-Origin-Ingress` header with this worker's and
    /// connection's identity, inserted at the end of the header block.
    fn stamp_origin_ingress(&self, metadata: &MessageMetadataRef) {
        let Some(origin) = self.callbacks.origin_ingress() else {
            return;
        };
        let mut md = metadata.borrow_mut();
        if md
            .list_header(HeaderType::XEnvoyOriginIngress)
            .iter()
            .any(|header| header.raw_offset().is_none())
        {
            return;
        }

        for header in md.remove_headers(HeaderType::XEnvoyOriginIngress) {
            if let Some(position) = header.raw_offset() {
                md.set_operation(Operation::Delete {
                    position,
                    length: header.raw_len(),
                });
            }
        }

        let value = origin.to_header_value();
        let position = md.headers_end();
        md.set_operation(Operation::Insert {
            position,
            value: format!("{}: {}\r\n", ORIGIN_INGRESS_HEADER, value),
        });
        md.add_header(SipHeader::new(HeaderType::XEnvoyOriginIngress, value));
    }

    /// Mark the transaction deleted; the next audit removes it.
    pub fn on_destroy(&mut self) {
        if let Some(transaction_info) = &self.transaction_info {
            transaction_info.delete_transaction(self.callbacks.transaction_id());
        }
        self.upstream_connection = None;
        self.metadata = None;
    }
}
