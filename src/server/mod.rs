//! Worker threads and downstream connections.
//!
//! # Data Flow
//! ```text
//! main
//!     → worker.rs spawn_workers (one thread + LocalSet each)
//!         → WorkerContext (per-worker tables, cluster manager, TRA handler)
//!         → accept on the shared listener
//!         → conn_manager.rs serve_connection per downstream socket
//!             → ConnectionManager → Router per transaction
//!         → periodic transaction audit
//! ```
//!
//! # Design Decisions
//! - Nothing per-worker is global; it is reached through `WorkerContext`
//! - Cross-task work inside a worker travels as `ConnEvent` messages

pub mod conn_manager;
pub mod worker;

pub use conn_manager::{ConnEvent, ConnectionManager, DownstreamChannel, TransactionCallbacks};
pub use worker::{spawn_workers, SharedState, WorkerContext};
