//! Traffic routing assistant (TRA) integration.
//!
//! # Data Flow
//! ```text
//! Router affinity candidate (type, key)
//!     → handler.rs (cache lookup, in-flight de-duplication)
//!     → client.rs (HTTP query, runs on the worker LocalSet)
//!     → cache.rs (shared across workers)
//!     → pending list resumes the paused transactions
//! ```
//!
//! # Design Decisions
//! - Queries never block a worker; the transaction stops iteration
//! - Completion is delivered as a message, never as a router call

pub mod cache;
pub mod client;
pub mod handler;

pub use cache::TraCache;
pub use client::{HttpTraClient, QueryContext, TraClient, TraData, TraError, TraResult};
pub use handler::TraHandler;
