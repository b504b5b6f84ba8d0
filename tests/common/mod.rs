//! Shared fakes and builders for router integration tests.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{self, FutureExt, LocalBoxFuture};

use sip_router::cluster::{
    ClusterInfo, ClusterManager, ConnectionEvent, LoadBalancerContext, PoolCallbacks, PoolFailureReason,
    PoolHandle, TcpConnPool, ThreadLocalCluster, UpstreamCallbacks, UpstreamTransport,
};
use sip_router::config::ProtocolOptionsConfig;
use sip_router::load_balancer::host::Host;
use sip_router::router::{
    DecoderFilterCallbacks, DownstreamConnectionInfos, OriginIngress, PendingList, ResponseStatus, ResumeAction,
    ResumeSink, Router, RouterStats, ThreadLocalTransactionInfo, ThreadLocalTransactionInfos,
};
use sip_router::routing::RouteEntry;
use sip_router::sip::{decoder, MessageMetadataRef};
use sip_router::tra::{QueryContext, TraClient, TraData, TraHandler, TraResult};

pub const CLUSTER: &str = "cluster_0";
pub const THREAD_ID: &str = "worker-0";
pub const DOMAIN: &str = "scscf.example.com";

// --- Upstream side ---

#[derive(Default)]
pub struct FakeTransport {
    writes: RefCell<Vec<Bytes>>,
    closed: Cell<bool>,
    callbacks: RefCell<Option<Weak<dyn UpstreamCallbacks>>>,
}

impl FakeTransport {
    pub fn written(&self) -> Vec<String> {
        self.writes
            .borrow()
            .iter()
            .map(|data| String::from_utf8_lossy(data).into_owned())
            .collect()
    }

    fn upstream_callbacks(&self) -> Option<Rc<dyn UpstreamCallbacks>> {
        self.callbacks.borrow().clone().and_then(|callbacks| callbacks.upgrade())
    }

    /// Bytes arriving from the upstream host.
    pub fn deliver(&self, data: &str) {
        if let Some(callbacks) = self.upstream_callbacks() {
            callbacks.on_upstream_data(data.as_bytes());
        }
    }

    pub fn remote_close(&self) {
        self.closed.set(true);
        if let Some(callbacks) = self.upstream_callbacks() {
            callbacks.on_event(ConnectionEvent::RemoteClose);
        }
    }
}

impl UpstreamTransport for FakeTransport {
    fn write(&self, data: Bytes) {
        self.writes.borrow_mut().push(data);
    }

    fn close(&self) {
        self.closed.set(true);
    }

    fn is_open(&self) -> bool {
        !self.closed.get()
    }

    fn set_upstream_callbacks(&self, callbacks: Weak<dyn UpstreamCallbacks>) {
        *self.callbacks.borrow_mut() = Some(callbacks);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    Ready,
    Pending,
    Fail(PoolFailureReason),
}

pub struct FakePool {
    pub host: Arc<Host>,
    pub transport: Rc<FakeTransport>,
    mode: Cell<PoolMode>,
    waiting: RefCell<Vec<Rc<dyn PoolCallbacks>>>,
    requests: Cell<usize>,
}

impl FakePool {
    pub fn new(addr: &str, mode: PoolMode) -> Rc<Self> {
        Rc::new(Self {
            host: Arc::new(Host::new(addr.parse().unwrap(), 16)),
            transport: Rc::new(FakeTransport::default()),
            mode: Cell::new(mode),
            waiting: RefCell::new(Vec::new()),
            requests: Cell::new(0),
        })
    }

    pub fn set_mode(&self, mode: PoolMode) {
        self.mode.set(mode);
    }

    pub fn requests(&self) -> usize {
        self.requests.get()
    }

    /// Finish every pending connection attempt successfully.
    pub fn complete(&self) {
        let waiting: Vec<_> = self.waiting.borrow_mut().drain(..).collect();
        for callbacks in waiting {
            callbacks.on_pool_ready(self.transport.clone(), self.host.clone());
        }
    }

    /// Fail every pending connection attempt.
    pub fn fail(&self, reason: PoolFailureReason) {
        let waiting: Vec<_> = self.waiting.borrow_mut().drain(..).collect();
        for callbacks in waiting {
            callbacks.on_pool_failure(reason, Some(self.host.clone()));
        }
    }
}

impl TcpConnPool for FakePool {
    fn host(&self) -> Option<Arc<Host>> {
        Some(self.host.clone())
    }

    fn new_connection(&self, callbacks: Rc<dyn PoolCallbacks>) -> Result<PoolHandle, PoolFailureReason> {
        self.requests.set(self.requests.get() + 1);
        match self.mode.get() {
            PoolMode::Ready => {
                callbacks.on_pool_ready(self.transport.clone(), self.host.clone());
                Ok(PoolHandle::Ready)
            }
            PoolMode::Pending => {
                self.waiting.borrow_mut().push(callbacks);
                Ok(PoolHandle::Pending)
            }
            PoolMode::Fail(reason) => Err(reason),
        }
    }
}

pub struct FakeCluster {
    pub info: Arc<ClusterInfo>,
    pub pools: Vec<Rc<FakePool>>,
}

impl ThreadLocalCluster for FakeCluster {
    fn info(&self) -> Arc<ClusterInfo> {
        self.info.clone()
    }

    fn tcp_conn_pool(&self, context: &LoadBalancerContext<'_>) -> Option<Rc<dyn TcpConnPool>> {
        let pool = match context.destination {
            Some(destination) => self
                .pools
                .iter()
                .find(|pool| pool.host.matches_destination(destination))
                .or_else(|| self.pools.first()),
            None => self.pools.first(),
        }?;
        Some(pool.clone())
    }
}

#[derive(Default)]
pub struct FakeClusterManager {
    clusters: RefCell<HashMap<String, Rc<FakeCluster>>>,
}

impl FakeClusterManager {
    pub fn add(&self, cluster: FakeCluster) {
        self.clusters
            .borrow_mut()
            .insert(cluster.info.name.clone(), Rc::new(cluster));
    }
}

impl ClusterManager for FakeClusterManager {
    fn get_thread_local_cluster(&self, name: &str) -> Option<Rc<dyn ThreadLocalCluster>> {
        let cluster = self.clusters.borrow().get(name).cloned()?;
        Some(cluster)
    }
}

// --- Downstream side ---

#[derive(Default)]
pub struct ResumeRecorder {
    pub resumed: RefCell<Vec<(String, ResumeAction)>>,
}

impl ResumeSink for ResumeRecorder {
    fn resume(&self, transaction_id: &str, action: ResumeAction) {
        self.resumed
            .borrow_mut()
            .push((transaction_id.to_string(), action));
    }
}

/// Callbacks that record everything the router asks of them.
pub struct RecordingCallbacks {
    pub transaction_id: String,
    pub route: Option<Arc<RouteEntry>>,
    pub origin: OriginIngress,
    pub transaction_infos: Rc<ThreadLocalTransactionInfos>,
    pub downstream: Rc<DownstreamConnectionInfos>,
    pub tra: Option<Rc<TraHandler>>,
    pub pending_list: Rc<PendingList>,
    pub resumes: Rc<ResumeRecorder>,
    pub delivered: RefCell<Vec<(MessageMetadataRef, Option<String>)>>,
    pub pending: RefCell<Vec<(String, String)>>,
    pub continued: RefCell<Vec<(String, bool)>>,
    pub resets: Cell<usize>,
}

impl DecoderFilterCallbacks for RecordingCallbacks {
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
        self.transaction_infos.clone()
    }

    fn downstream_connection_infos(&self) -> Rc<DownstreamConnectionInfos> {
        self.downstream.clone()
    }

    fn tra_handler(&self) -> Option<Rc<TraHandler>> {
        self.tra.clone()
    }

    fn upstream_data(
        &self,
        metadata: MessageMetadataRef,
        _route: Option<Arc<RouteEntry>>,
        return_destination: Option<String>,
    ) -> ResponseStatus {
        self.delivered.borrow_mut().push((metadata, return_destination));
        ResponseStatus::Complete
    }

    fn push_into_pending_list(&self, kind: &str, key: &str) {
        self.pending.borrow_mut().push((kind.to_string(), key.to_string()));
        self.pending_list
            .push(kind, key, &self.transaction_id, self.resumes.clone());
    }

    fn continue_handling(&self, key: &str, try_next_affinity: bool) {
        self.continued.borrow_mut().push((key.to_string(), try_next_affinity));
    }

    fn on_reset(&self) {
        self.resets.set(self.resets.get() + 1);
    }
}

/// One worker's tables plus a single cluster of fake hosts.
pub struct Harness {
    pub cluster_manager: Rc<FakeClusterManager>,
    pub pools: Vec<Rc<FakePool>>,
    pub transaction_infos: Rc<ThreadLocalTransactionInfos>,
    pub tinfo: Rc<ThreadLocalTransactionInfo>,
    pub downstream: Rc<DownstreamConnectionInfos>,
    pub pending_list: Rc<PendingList>,
    pub stats: Arc<RouterStats>,
    pub tra: Option<Rc<TraHandler>>,
}

impl Harness {
    pub fn new(options: ProtocolOptionsConfig) -> Self {
        Self::with_hosts(options, &["10.0.0.1:5060"], PoolMode::Ready)
    }

    pub fn with_hosts(options: ProtocolOptionsConfig, hosts: &[&str], mode: PoolMode) -> Self {
        Self::build(ClusterInfo::new(CLUSTER, options), hosts, mode)
    }

    pub fn build(info: ClusterInfo, hosts: &[&str], mode: PoolMode) -> Self {
        let pools: Vec<_> = hosts.iter().map(|addr| FakePool::new(addr, mode)).collect();
        let cluster_manager = Rc::new(FakeClusterManager::default());
        cluster_manager.add(FakeCluster {
            info: Arc::new(info),
            pools: pools.clone(),
        });

        let tinfo = Rc::new(ThreadLocalTransactionInfo::new(CLUSTER, Duration::from_secs(32)));
        let mut transaction_infos = ThreadLocalTransactionInfos::default();
        transaction_infos.insert(tinfo.clone());

        Self {
            cluster_manager,
            pools,
            transaction_infos: Rc::new(transaction_infos),
            tinfo,
            downstream: Rc::new(DownstreamConnectionInfos::new(THREAD_ID)),
            pending_list: Rc::new(PendingList::new()),
            stats: Arc::new(RouterStats::new("test")),
            tra: None,
        }
    }

    pub fn pool(&self, index: usize) -> &Rc<FakePool> {
        &self.pools[index]
    }

    pub fn route(&self) -> Arc<RouteEntry> {
        Arc::new(RouteEntry::new("scscf", DOMAIN, "Route", "host", CLUSTER))
    }

    pub fn callbacks(&self, transaction_id: &str) -> Rc<RecordingCallbacks> {
        self.callbacks_with_route(transaction_id, Some(self.route()))
    }

    pub fn callbacks_with_route(
        &self,
        transaction_id: &str,
        route: Option<Arc<RouteEntry>>,
    ) -> Rc<RecordingCallbacks> {
        Rc::new(RecordingCallbacks {
            transaction_id: transaction_id.to_string(),
            route,
            origin: OriginIngress::new(THREAD_ID, "abc"),
            transaction_infos: self.transaction_infos.clone(),
            downstream: self.downstream.clone(),
            tra: self.tra.clone(),
            pending_list: self.pending_list.clone(),
            resumes: Rc::new(ResumeRecorder::default()),
            delivered: RefCell::new(Vec::new()),
            pending: RefCell::new(Vec::new()),
            continued: RefCell::new(Vec::new()),
            resets: Cell::new(0),
        })
    }

    pub fn router(&self, callbacks: Rc<RecordingCallbacks>) -> Router {
        Router::new(self.cluster_manager.clone(), self.stats.clone(), callbacks)
    }
}

// --- TRA ---

#[derive(Default)]
pub struct FakeTraClient {
    pub answers: RefCell<HashMap<(String, String), String>>,
    pub snapshots: RefCell<HashMap<String, TraData>>,
    pub retrieves: Cell<usize>,
    pub subscribes: RefCell<Vec<String>>,
    pub updates: RefCell<Vec<(String, TraData)>>,
    pub deletes: RefCell<Vec<(String, String)>>,
}

impl FakeTraClient {
    pub fn answer(&self, affinity_type: &str, key: &str, host: &str) {
        self.answers
            .borrow_mut()
            .insert((affinity_type.to_string(), key.to_string()), host.to_string());
    }
}

impl TraClient for FakeTraClient {
    fn retrieve(&self, affinity_type: &str, key: &str, _context: &QueryContext) -> LocalBoxFuture<'static, TraResult<TraData>> {
        self.retrieves.set(self.retrieves.get() + 1);
        let data: TraData = self
            .answers
            .borrow()
            .get(&(affinity_type.to_string(), key.to_string()))
            .map(|host| HashMap::from([(key.to_string(), host.clone())]))
            .unwrap_or_default();
        future::ready(Ok(data)).boxed_local()
    }

    fn subscribe(&self, affinity_type: &str) -> LocalBoxFuture<'static, TraResult<TraData>> {
        self.subscribes.borrow_mut().push(affinity_type.to_string());
        let data = self
            .snapshots
            .borrow()
            .get(affinity_type)
            .cloned()
            .unwrap_or_default();
        future::ready(Ok(data)).boxed_local()
    }

    fn update(&self, affinity_type: &str, data: &TraData, _context: &QueryContext) -> LocalBoxFuture<'static, TraResult<()>> {
        self.updates
            .borrow_mut()
            .push((affinity_type.to_string(), data.clone()));
        future::ready(Ok(())).boxed_local()
    }

    fn delete(&self, affinity_type: &str, key: &str, _context: &QueryContext) -> LocalBoxFuture<'static, TraResult<()>> {
        self.deletes
            .borrow_mut()
            .push((affinity_type.to_string(), key.to_string()));
        future::ready(Ok(())).boxed_local()
    }
}

// --- SIP builders ---

/// A request with the given branch; `extra` lines go before Content-Length.
pub fn request(method: &str, branch: &str, route: &str, extra: &[&str]) -> String {
    let mut message = format!(
        "{method} sip:bob@{DOMAIN} SIP/2.0\r\n\
         Via: SIP/2.0/TCP 10.0.0.9:5060;branch={branch}\r\n\
         Route: {route}\r\n\
         From: <sip:alice@example.com>;tag=a1\r\n\
         To: <sip:bob@example.com>\r\n\
         Call-ID: call-{branch}\r\n\
         CSeq: 1 {method}\r\n"
    );
    for line in extra {
        message.push_str(line);
        message.push_str("\r\n");
    }
    message.push_str("Content-Length: 0\r\n\r\n");
    message
}

pub fn invite(branch: &str) -> String {
    request("INVITE", branch, &format!("<sip:{DOMAIN};lr>"), &[])
}

pub fn response(code: u16, reason: &str, branch: &str, method: &str) -> String {
    format!(
        "SIP/2.0 {code} {reason}\r\n\
         Via: SIP/2.0/TCP 10.0.0.9:5060;branch={branch}\r\n\
         From: <sip:alice@example.com>;tag=a1\r\n\
         To: <sip:bob@example.com>;tag=b1\r\n\
         Call-ID: call-{branch}\r\n\
         CSeq: 1 {method}\r\n\
         Content-Length: 0\r\n\r\n"
    )
}

pub fn decode(message: &str) -> MessageMetadataRef {
    decoder::decode(Bytes::from(message.to_string()))
        .unwrap()
        .into_ref()
}
