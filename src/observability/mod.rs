//! Logging and metrics.
//!
//! # Data Flow
//! ```text
//! router, conn_manager, tra, cluster
//!     → tracing events with transaction_id / host / cluster fields
//!       → logging.rs (fmt layer on stdout, EnvFilter)
//!     → RouterStats counters and connection gauges
//!       → metrics.rs (Prometheus exporter, scraped over HTTP)
//! ```
//!
//! # Design Decisions
//! - `RouterStats` keeps its own counts next to the `metrics` facade,
//!   which is a no-op until a recorder is installed

pub mod logging;
pub mod metrics;
