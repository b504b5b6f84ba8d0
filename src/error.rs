//! Routing errors.
//!
//! # Responsibilities
//! - Classify every reason a message cannot be routed
//! - Map each class to the SIP status used in the local reply
//! - Name the counter incremented when the class is raised
//!
//! # Design Decisions
//! - Returned as `Result` from `transport_begin`/`message_begin`; the
//!   connection manager is the only place that turns them into replies
//! - Forwarding precondition failures (bad origin ingress, wrong worker)
//!   are not errors here: they are logged and dropped at the call site

use thiserror::Error;

/// SIP status classes used for locally generated replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ServiceUnavailable,
    ServerInternalError,
}

impl ErrorCode {
    pub fn status(&self) -> u16 {
        match self {
            ErrorCode::ServiceUnavailable => 503,
            ErrorCode::ServerInternalError => 500,
        }
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self {
            ErrorCode::ServiceUnavailable => "Service Unavailable",
            ErrorCode::ServerInternalError => "Server Internal Error",
        }
    }
}

/// Reasons the router gives up on a message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("no route matched the request")]
    RouteMissing,

    #[error("unknown cluster '{0}'")]
    UnknownCluster(String),

    #[error("maintenance mode for cluster '{0}'")]
    MaintenanceMode(String),

    #[error("no healthy upstream for cluster '{0}'")]
    NoHealthyUpstream(String),

    #[error("no affinity candidate resolved and load balancing is disabled")]
    AffinityExhausted,

    #[error("sip upstream request: too many connections to {0}")]
    Overflow(String),

    #[error("envoy can't establish connection to {0}")]
    ConnectionExhausted(String),
}

impl RouterError {
    /// Status of the local reply sent for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RouterError::AffinityExhausted | RouterError::ConnectionExhausted(_) => {
                ErrorCode::ServerInternalError
            }
            _ => ErrorCode::ServiceUnavailable,
        }
    }

    /// Counter incremented when this error is raised.
    pub fn stat_name(&self) -> &'static str {
        match self {
            RouterError::RouteMissing => "route_missing",
            RouterError::UnknownCluster(_) => "unknown_cluster",
            RouterError::MaintenanceMode(_) => "upstream_rq_maintenance_mode",
            RouterError::NoHealthyUpstream(_) => "no_healthy_upstream",
            RouterError::AffinityExhausted => "affinity_exhausted",
            RouterError::Overflow(_) => "upstream_cx_overflow",
            RouterError::ConnectionExhausted(_) => "upstream_cx_exhausted",
        }
    }
}

pub type RouterResult<T> = Result<T, RouterError>;
