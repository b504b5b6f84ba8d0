//! SIP-over-TCP routing proxy library.

pub mod cluster;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod router;
pub mod routing;
pub mod server;
pub mod sip;
pub mod tra;

pub use config::schema::RouterConfig;
pub use error::{RouterError, RouterResult};
pub use lifecycle::Shutdown;
