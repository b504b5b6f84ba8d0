//! Traffic routing assistant client.
//!
//! The service is reached over JSON/HTTP:
//! - `POST {endpoint}/retrieve` with `{"type", "key", "context"}`
//! - `POST {endpoint}/subscribe` with `{"type"}`
//! - `POST {endpoint}/update` with `{"type", "data", "context"}`
//! - `POST {endpoint}/delete` with `{"type", "key", "context"}`
//!
//! Retrieve and subscribe answer `{"data": {"<key>": "<host>", ...}}`.
//! Only the status of update and delete is looked at.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::{FutureExt, LocalBoxFuture};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::schema::TraServiceConfig;

#[derive(Debug, Error)]
pub enum TraError {
    #[error("tra request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tra service returned status {0}")]
    Status(u16),
}

pub type TraResult<T> = Result<T, TraError>;

/// Key -> host pairs returned by the service.
pub type TraData = HashMap<String, String>;

/// Who is asking, forwarded to the service for its own bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryContext {
    pub thread_id: String,
    pub transaction_id: String,
}

pub trait TraClient {
    fn retrieve(&self, affinity_type: &str, key: &str, context: &QueryContext) -> LocalBoxFuture<'static, TraResult<TraData>>;

    fn subscribe(&self, affinity_type: &str) -> LocalBoxFuture<'static, TraResult<TraData>>;

    /// Publish key -> host pairs learned by this proxy.
    fn update(&self, affinity_type: &str, data: &TraData, context: &QueryContext) -> LocalBoxFuture<'static, TraResult<()>>;

    fn delete(&self, affinity_type: &str, key: &str, context: &QueryContext) -> LocalBoxFuture<'static, TraResult<()>>;
}

#[derive(Serialize)]
struct RetrieveRequest<'a> {
    #[serde(rename = "type")]
    affinity_type: &'a str,
    key: &'a str,
    context: &'a QueryContext,
}

#[derive(Serialize)]
struct SubscribeRequest<'a> {
    #[serde(rename = "type")]
    affinity_type: &'a str,
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    #[serde(rename = "type")]
    affinity_type: &'a str,
    data: &'a TraData,
    context: &'a QueryContext,
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
    #[serde(rename = "type")]
    affinity_type: &'a str,
    key: &'a str,
    context: &'a QueryContext,
}

#[derive(Deserialize, Default)]
struct TraResponse {
    #[serde(default)]
    data: TraData,
}

#[derive(Debug, Clone)]
pub struct HttpTraClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTraClient {
    pub fn new(config: &TraServiceConfig) -> TraResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn post<B: Serialize>(&self, path: &str, body: &B) -> LocalBoxFuture<'static, TraResult<TraData>> {
        let request = self.client.post(format!("{}/{}", self.endpoint, path)).json(body);
        async move {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(TraError::Status(status.as_u16()));
            }
            let body: TraResponse = response.json().await?;
            Ok(body.data)
        }
        .boxed_local()
    }

    fn notify<B: Serialize>(&self, path: &str, body: &B) -> LocalBoxFuture<'static, TraResult<()>> {
        let request = self.client.post(format!("{}/{}", self.endpoint, path)).json(body);
        async move {
            let status = request.send().await?.status();
            if !status.is_success() {
                return Err(TraError::Status(status.as_u16()));
            }
            Ok(())
        }
        .boxed_local()
    }
}

impl TraClient for HttpTraClient {
    fn retrieve(&self, affinity_type: &str, key: &str, context: &QueryContext) -> LocalBoxFuture<'static, TraResult<TraData>> {
        self.post(
            "retrieve",
            &RetrieveRequest {
                affinity_type,
                key,
                context,
            },
        )
    }

    fn subscribe(&self, affinity_type: &str) -> LocalBoxFuture<'static, TraResult<TraData>> {
        self.post("subscribe", &SubscribeRequest { affinity_type })
    }

    fn update(&self, affinity_type: &str, data: &TraData, context: &QueryContext) -> LocalBoxFuture<'static, TraResult<()>> {
        self.notify(
            "update",
            &UpdateRequest {
                affinity_type,
                data,
                context,
            },
        )
    }

    fn delete(&self, affinity_type: &str, key: &str, context: &QueryContext) -> LocalBoxFuture<'static, TraResult<()>> {
        self.notify(
            "delete",
            &DeleteRequest {
                affinity_type,
                key,
                context,
            },
        )
    }
}
