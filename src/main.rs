//! SIP router
//!
//! A SIP-over-TCP routing proxy built with Tokio.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────────────────┐
//!                      │                      SIP ROUTER                           │
//!                      │                                                           │
//!   Downstream client  │  ┌──────────┐   ┌──────────────┐   ┌──────────────┐       │
//!   ───────────────────┼─▶│   net    │──▶│ conn_manager │──▶│    router    │       │
//!                      │  │ listener │   │ (per worker) │   │ (per trans)  │       │
//!                      │  └──────────┘   └──────┬───────┘   └──────┬───────┘       │
//!                      │                        │                  │               │
//!                      │             ConnEvent  │        affinity  │  TRA          │
//!                      │             (resume)   │        routing   │  handler      │
//!                      │                        │                  ▼               │
//!                      │                 ┌──────┴───────┐   ┌──────────────┐       │
//!   ◀──────────────────┼─────────────────│ downstream   │◀──│   upstream   │◀──────┼──▶ Upstream
//!                      │                 │ conn infos   │   │  connection  │       │    hosts
//!                      │                 └──────────────┘   └──────────────┘       │
//!                      │                                                           │
//!                      │  Cross-cutting: config (hot routes), observability,       │
//!                      │  lifecycle (signals, drain), load_balancer, cluster       │
//!                      └──────────────────────────────────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use sip_router::config::loader::load_config;
use sip_router::config::watcher::ConfigWatcher;
use sip_router::config::RouterConfig;
use sip_router::lifecycle::signals::{SignalEvent, Signals};
use sip_router::lifecycle::Shutdown;
use sip_router::net::listener::SharedListener;
use sip_router::observability::logging::init_logging;
use sip_router::observability::metrics::init_metrics;
use sip_router::routing::RouteMatcher;
use sip_router::server::{spawn_workers, SharedState};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "sip-router", version, about = "SIP-over-TCP routing proxy")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "sip-router.toml")]
    config: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    init_logging(&config.observability.log_level);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "sip-router starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("control")
        .enable_all()
        .build()?;
    runtime.block_on(run(&args.config, config))
}

async fn run(path: &Path, config: RouterConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        bind_address = %config.listener.bind_address,
        concurrency = config.concurrency,
        routes = config.route_config.routes.len(),
        clusters = config.clusters.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shared = SharedState::from_config(&config);
    let listener = Arc::new(SharedListener::bind(&config.listener)?);
    let shutdown = Shutdown::new();
    let workers = spawn_workers(config.concurrency, listener, shared.clone(), shutdown.clone())?;

    let (watcher, mut updates) = ConfigWatcher::new(path);
    let reload = watcher.reload_handle();
    let _watcher = match watcher.run() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "Config watcher unavailable, reload on SIGHUP only");
            None
        }
    };

    let mut signals = Signals::new()?;
    loop {
        tokio::select! {
            event = signals.recv() => match event {
                SignalEvent::Shutdown => break,
                SignalEvent::Reload => reload.reload(),
            },
            Some(new_config) = updates.recv() => {
                let routes = RouteMatcher::from_config(&new_config);
                tracing::info!(routes = routes.len(), "Route table reloaded");
                shared.routes.store(Arc::new(routes));
            }
        }
    }

    shutdown.trigger();
    if !shared.tracker.wait_for_drain(DRAIN_TIMEOUT).await {
        tracing::warn!(active = shared.tracker.active_count(), "Drain deadline passed");
    }
    for handle in workers {
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => {}
            _ => tracing::error!("Worker thread panicked"),
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
