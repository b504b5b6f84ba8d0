//! Downstream TCP plumbing.
//!
//! # Data Flow
//! ```text
//! SIP client connects
//!     → listener.rs (one bound socket, an accept handle per worker, slot cap)
//!     → connection.rs (connection id, open-connection count)
//!     → server::worker serves it with a ConnectionManager
//! ```
//!
//! # Design Decisions
//! - A connection stays on the worker that accepted it until it closes

pub mod connection;
pub mod listener;
