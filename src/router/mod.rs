//! SIP transaction router.
//!
//! # Data Flow
//! ```text
//! Downstream message (ConnectionManager)
//!     → engine.rs Router::transport_begin (route, cluster, affinity.rs)
//!     → Router::message_begin
//!         - affinity cursor: ep from the message, others via TRA
//!         - cluster pool for destination / load balancer
//!         - transaction.rs: reuse or create UpstreamConnection per host
//!         - pending.rs: park while connecting or querying
//!     → Router::transport_end (X-Envoy-Origin-Ingress rewrite, write)
//!
//! Upstream bytes (upstream.rs)
//!     → response: callbacks stored for the transaction id
//!     → request: upstream_request.rs (origin ingress checks)
//!         → downstream.rs lookup → DecoderFilterCallbacks::upstream_data
//! ```
//!
//! # Design Decisions
//! - Per-worker state (`Rc`/`RefCell`) is reached through the callbacks,
//!   never through globals
//! - Routing failures are `RouterError` values; the connection manager
//!   turns them into local replies
//! - A paused transaction is resumed by a message to its connection, not
//!   by re-entering the router from a callback

pub mod affinity;
pub mod downstream;
pub mod engine;
pub mod filter;
pub mod origin_ingress;
pub mod pending;
pub mod stats;
pub mod transaction;
pub mod upstream;
pub mod upstream_request;

pub use downstream::DownstreamConnectionInfos;
pub use engine::Router;
pub use filter::DecoderFilterCallbacks;
pub use origin_ingress::{OriginIngress, OriginIngressError};
pub use pending::{PendingList, ResumeAction, ResumeSink, CONNECTION_PENDING};
pub use stats::RouterStats;
pub use transaction::{
    ThreadLocalTransactionInfo, ThreadLocalTransactionInfos, TransactionInfo, TransactionInfoItem,
    TransactionInfos,
};
pub use upstream::{ConnectionState, UpstreamConnection};

/// Whether the caller should keep processing the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
    StopIteration,
}

/// Result of delivering an upstream message downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Complete,
    Reset,
}

/// Result of an affinity lookup through the TRA handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Continue,
    Pending,
    Stop,
}
