//! Process lifecycle: shutdown and reload.
//!
//! # Data Flow
//! ```text
//! SIGTERM / SIGINT (signals.rs)
//!     → Shutdown::trigger (shutdown.rs)
//!     → workers leave their accept loops, connections stop reading
//!     → ConnectionTracker drains, workers are joined
//!
//! SIGHUP (signals.rs)
//!     → ConfigWatcher reload → new RouteMatcher stored for every worker
//! ```
//!
//! # Design Decisions
//! - Workers and connection tasks each hold a broadcast receiver; there is
//!   no per-connection cancellation handle
//! - Draining is bounded by a deadline in both `main` and each worker

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
