//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Decoded message (method, headers)
//!     → matcher.rs (RouteMatcher::route)
//!     → rule header chosen (Route, TopLine fallback, or configured name)
//!     → domain extracted from header parameter
//!     → Return: matched RouteEntry (cluster name) or None
//!
//! Route Compilation (at startup and on reload):
//!     RouteConfig[] + local_services
//!     → Compile RouteEntry list (configuration order)
//!     → Freeze as immutable RouteMatcher behind ArcSwap
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime; reload swaps the table
//! - Deterministic: same input always matches same route
//! - First match wins (configuration order)

pub mod matcher;

pub use matcher::{RouteEntry, RouteMatcher};
