//! The `X-Envoy-Origin-Ingress` header value.
//!
//! Identifies the worker and downstream connection a request left through,
//! so that a request later initiated by the upstream host can be delivered
//! back to the same downstream connection.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub const ORIGIN_INGRESS_HEADER: &str = "X-Envoy-Origin-Ingress";

const THREAD_PARAM: &str = "thread";
const DOWNSTREAM_CONNECTION_PARAM: &str = "downstream-connection";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OriginIngressError {
    #[error("missing thread parameter")]
    MissingThread,

    #[error("missing downstream-connection parameter")]
    MissingDownstreamConnection,

    #[error("malformed parameter '{0}'")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginIngress {
    thread_id: String,
    downstream_connection_id: String,
}

impl OriginIngress {
    pub fn new(thread_id: impl Into<String>, downstream_connection_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            downstream_connection_id: downstream_connection_id.into(),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn downstream_connection_id(&self) -> &str {
        &self.downstream_connection_id
    }

    /// `thread=<id>; downstream-connection=<id>`
    pub fn to_header_value(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for OriginIngress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={}; {}={}",
            THREAD_PARAM, self.thread_id, DOWNSTREAM_CONNECTION_PARAM, self.downstream_connection_id
        )
    }
}

impl FromStr for OriginIngress {
    type Err = OriginIngressError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut thread_id = None;
        let mut downstream_connection_id = None;

        for param in value.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, val) = param
                .split_once('=')
                .ok_or_else(|| OriginIngressError::Malformed(param.to_string()))?;
            let val = val.trim();
            match name.trim() {
                THREAD_PARAM => thread_id = Some(val),
                DOWNSTREAM_CONNECTION_PARAM => downstream_connection_id = Some(val),
                _ => {}
            }
        }

        let thread_id = thread_id
            .filter(|v| !v.is_empty())
            .ok_or(OriginIngressError::MissingThread)?;
        let downstream_connection_id = downstream_connection_id
            .filter(|v| !v.is_empty())
            .ok_or(OriginIngressError::MissingDownstreamConnection)?;

        Ok(Self::new(thread_id, downstream_connection_id))
    }
}
