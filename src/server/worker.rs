//! Worker threads.
//!
//! # Responsibilities
//! - One OS thread per worker, each with a current-thread runtime and a
//!   `LocalSet` so that per-worker state can be `Rc`/`RefCell`
//! - Build the `WorkerContext` (cluster manager, transaction tables,
//!   downstream registry, pending list, TRA handler)
//! - Accept downstream connections and run the periodic transaction audit
//!
//! # Design Decisions
//! - Everything shared between workers lives in `SharedState` and is
//!   `Send + Sync`; everything else is created inside the worker thread
//! - Thread ids (`worker-N`) are the values stamped into
//!   `X-Envoy-Origin-Ingress`

use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::task::LocalSet;

use crate::cluster::{ClusterManager, StaticClusterManager};
use crate::config::schema::SettingsConfig;
use crate::config::{ClusterConfig, RouterConfig};
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::SharedListener;
use crate::router::{
    DownstreamConnectionInfos, PendingList, RouterStats, ThreadLocalTransactionInfos, TransactionInfo,
    TransactionInfos,
};
use crate::routing::RouteMatcher;
use crate::server::conn_manager::serve_connection;
use crate::tra::{HttpTraClient, TraCache, TraClient, TraHandler, TraResult};

/// How long a stopping worker waits for its connections to close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared by all workers.
#[derive(Clone)]
pub struct SharedState {
    pub settings: Arc<SettingsConfig>,
    pub clusters: Arc<Vec<ClusterConfig>>,
    pub routes: Arc<ArcSwap<RouteMatcher>>,
    pub transaction_infos: TransactionInfos,
    pub tra_cache: Option<Arc<TraCache>>,
    pub stats: Arc<RouterStats>,
    pub tracker: ConnectionTracker,
}

impl SharedState {
    pub fn from_config(config: &RouterConfig) -> Self {
        let timeout = Duration::from_millis(config.settings.transaction_timeout_ms);
        let transaction_infos = TransactionInfos::new();
        for cluster in &config.clusters {
            transaction_infos.insert(TransactionInfo::new(cluster.name.clone(), timeout));
        }

        let tra_cache = config
            .settings
            .tra_service_config
            .as_ref()
            .map(|tra| Arc::new(TraCache::new(tra.max_cache_items)));

        Self {
            settings: Arc::new(config.settings.clone()),
            clusters: Arc::new(config.clusters.clone()),
            routes: Arc::new(ArcSwap::from_pointee(RouteMatcher::from_config(config))),
            transaction_infos,
            tra_cache,
            stats: Arc::new(RouterStats::new(config.stat_prefix.clone())),
            tracker: ConnectionTracker::new(),
        }
    }
}

/// Everything a worker's connections and routers reach.
pub struct WorkerContext {
    pub thread_id: String,
    pub settings: Arc<SettingsConfig>,
    pub routes: Arc<ArcSwap<RouteMatcher>>,
    pub cluster_manager: Rc<dyn ClusterManager>,
    pub transaction_infos: Rc<ThreadLocalTransactionInfos>,
    pub downstream_connection_infos: Rc<DownstreamConnectionInfos>,
    pub pending: Rc<PendingList>,
    pub tra_handler: Option<Rc<TraHandler>>,
    pub stats: Arc<RouterStats>,
}

impl WorkerContext {
    /// Build the worker's tables from the shared state. Must run on the
    /// worker thread.
    pub fn new(thread_id: impl Into<String>, shared: &SharedState) -> TraResult<Self> {
        let thread_id = thread_id.into();
        let pending = Rc::new(PendingList::new());

        let tra_handler = match (&shared.settings.tra_service_config, &shared.tra_cache) {
            (Some(config), Some(cache)) => {
                let client: Rc<dyn TraClient> = Rc::new(HttpTraClient::new(config)?);
                Some(Rc::new(TraHandler::new(
                    thread_id.clone(),
                    client,
                    cache.clone(),
                    pending.clone(),
                )))
            }
            _ => None,
        };

        Ok(Self {
            downstream_connection_infos: Rc::new(DownstreamConnectionInfos::new(thread_id.clone())),
            thread_id,
            settings: shared.settings.clone(),
            routes: shared.routes.clone(),
            cluster_manager: Rc::new(StaticClusterManager::new(&shared.clusters)),
            transaction_infos: Rc::new(shared.transaction_infos.thread_local()),
            pending,
            tra_handler,
            stats: shared.stats.clone(),
        })
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.transaction_timeout_ms)
    }

    pub fn audit_interval(&self) -> Duration {
        Duration::from_millis(self.settings.audit_interval_ms.max(1))
    }
}

/// Start `count` worker threads accepting on `listener`.
pub fn spawn_workers(
    count: usize,
    listener: Arc<SharedListener>,
    shared: SharedState,
    shutdown: Shutdown,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    (0..count.max(1))
        .map(|index| {
            let thread_id = format!("worker-{}", index);
            let listener = listener.clone();
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name(thread_id.clone())
                .spawn(move || run_worker(thread_id, listener, shared, shutdown))
        })
        .collect()
}

fn run_worker(thread_id: String, listener: Arc<SharedListener>, shared: SharedState, shutdown: Shutdown) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(worker = %thread_id, error = %e, "Failed to build worker runtime");
            return;
        }
    };

    let local = LocalSet::new();
    local.block_on(&runtime, worker_loop(thread_id, listener, shared, shutdown));
}

async fn worker_loop(thread_id: String, listener: Arc<SharedListener>, shared: SharedState, shutdown: Shutdown) {
    let ctx = match WorkerContext::new(thread_id.clone(), &shared) {
        Ok(ctx) => Rc::new(ctx),
        Err(e) => {
            tracing::error!(worker = %thread_id, error = %e, "Failed to build worker context");
            return;
        }
    };
    let listener = match listener.worker_listener() {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(worker = %thread_id, error = %e, "Failed to register listener");
            return;
        }
    };

    tokio::task::spawn_local(audit_loop(ctx.clone(), shutdown.clone()));
    tracing::info!(worker = %thread_id, "Worker started");

    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote, permit)) => {
                    let guard = shared.tracker.track(remote.to_string());
                    let connection_shutdown = shutdown.subscribe();
                    let ctx = ctx.clone();
                    tokio::task::spawn_local(async move {
                        serve_connection(ctx, stream, remote, connection_shutdown).await;
                        drop(guard);
                        drop(permit);
                    });
                }
                Err(e) => {
                    tracing::warn!(worker = %thread_id, error = %e, "Accept failed");
                }
            },
            _ = shutdown_rx.recv() => break,
        }
    }

    tracing::info!(worker = %thread_id, "Worker stopped accepting");
    if !shared.tracker.wait_for_drain(DRAIN_TIMEOUT).await {
        tracing::warn!(
            worker = %thread_id,
            active = shared.tracker.active_count(),
            "Connections still open at worker exit"
        );
    }
}

async fn audit_loop(ctx: Rc<WorkerContext>, shutdown: Shutdown) {
    let mut shutdown_rx = shutdown.subscribe();
    let mut interval = tokio::time::interval(ctx.audit_interval());
    loop {
        tokio::select! {
            _ = interval.tick() => ctx.transaction_infos.audit_timer_action(Instant::now()),
            _ = shutdown_rx.recv() => break,
        }
    }
}
