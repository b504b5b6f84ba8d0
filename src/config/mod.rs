//! Proxy configuration.
//!
//! # Data Flow
//! ```text
//! sip-router.toml
//!     → loader.rs (read, deserialize into RouterConfig)
//!     → validation.rs (route → cluster references, thresholds, TRA settings)
//!     → SharedState: clusters, transaction timeouts, route table
//!
//! File change or SIGHUP
//!     → watcher.rs reloads and validates
//!     → RouteMatcher rebuilt and stored in the shared ArcSwap
//!     → workers pick it up on their next request
//! ```
//!
//! # Design Decisions
//! - Only routes are reloaded live. Listener, clusters and settings are
//!   read once at startup
//! - Every section has defaults, so a file with one route and one cluster
//!   is a complete config

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::{ClusterConfig, ListenerConfig, ProtocolOptionsConfig, RouteConfig, RouterConfig};
