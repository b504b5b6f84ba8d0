//! Per-worker TRA handler.
//!
//! # Responsibilities
//! - Answer affinity lookups from the shared cache
//! - Issue at most one in-flight query per (type, key)
//! - Park the asking transaction and resume it when the query settles
//! - Subscribe once per affinity type
//! - Publish mappings this proxy learns, and withdraw them
//!
//! # Data Flow
//! ```text
//! retrieve(type, key)
//!     → cache hit: (Continue, host)
//!     → miss + query: pending list, spawn_local(client.retrieve) → (Pending, None)
//!     → miss: (Stop, None)
//! query completes
//!     → cache every non-empty pair
//!     → resume waiting transactions: Resolved(host) | NextAffinity
//! update(type, key, host) → cache write when changed → client.update
//! delete(type, key)       → cache evict → client.delete
//! ```

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use crate::router::pending::{PendingList, ResumeAction};
use crate::router::{DecoderFilterCallbacks, QueryStatus};
use crate::tra::cache::TraCache;
use crate::tra::client::{QueryContext, TraClient, TraData, TraResult};

pub struct TraHandler {
    thread_id: String,
    client: Rc<dyn TraClient>,
    cache: Arc<TraCache>,
    pending: Rc<PendingList>,
    in_flight: RefCell<HashSet<(String, String)>>,
    subscribed: RefCell<HashSet<String>>,
}

impl TraHandler {
    pub fn new(
        thread_id: impl Into<String>,
        client: Rc<dyn TraClient>,
        cache: Arc<TraCache>,
        pending: Rc<PendingList>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            client,
            cache,
            pending,
            in_flight: RefCell::new(HashSet::new()),
            subscribed: RefCell::new(HashSet::new()),
        }
    }

    pub fn cache(&self) -> &Arc<TraCache> {
        &self.cache
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.borrow().len()
    }

    /// Look up `key` of `affinity_type`. Must run inside a `LocalSet` when
    /// `query` is set and the cache misses.
    pub fn retrieve(
        self: &Rc<Self>,
        affinity_type: &str,
        key: &str,
        query: bool,
        callbacks: &dyn DecoderFilterCallbacks,
    ) -> (QueryStatus, Option<String>) {
        if let Some(host) = self.cache.get(affinity_type, key) {
            return (QueryStatus::Continue, Some(host));
        }
        if !query {
            return (QueryStatus::Stop, None);
        }

        callbacks.push_into_pending_list(affinity_type, key);

        let query_key = (affinity_type.to_string(), key.to_string());
        if !self.in_flight.borrow_mut().insert(query_key) {
            tracing::trace!(affinity = %affinity_type, key = %key, "TRA query already in flight");
            return (QueryStatus::Pending, None);
        }

        tracing::debug!(affinity = %affinity_type, key = %key, "Querying TRA");
        let context = self.context(callbacks.transaction_id());
        let request = self.client.retrieve(affinity_type, key, &context);
        let handler = self.clone();
        let (affinity_type, key) = (affinity_type.to_string(), key.to_string());
        tokio::task::spawn_local(async move {
            let result = request.await;
            handler.on_retrieve_complete(&affinity_type, &key, result);
        });

        (QueryStatus::Pending, None)
    }

    pub fn on_retrieve_complete(&self, affinity_type: &str, key: &str, result: TraResult<TraData>) {
        self.in_flight
            .borrow_mut()
            .remove(&(affinity_type.to_string(), key.to_string()));

        match result {
            Ok(data) => self.store(affinity_type, data),
            Err(e) => {
                tracing::warn!(affinity = %affinity_type, key = %key, error = %e, "TRA query failed");
            }
        }

        let action = match self.cache.get(affinity_type, key) {
            Some(host) => ResumeAction::Resolved(host),
            None => ResumeAction::NextAffinity {
                fail_when_exhausted: false,
            },
        };
        self.pending.resume(affinity_type, key, action);
    }

    /// Fetch a snapshot of `affinity_type` once per worker.
    pub fn subscribe(self: &Rc<Self>, affinity_type: &str) {
        if !self.subscribed.borrow_mut().insert(affinity_type.to_string()) {
            return;
        }

        tracing::info!(affinity = %affinity_type, "Subscribing to TRA affinity type");
        let request = self.client.subscribe(affinity_type);
        let handler = self.clone();
        let affinity_type = affinity_type.to_string();
        tokio::task::spawn_local(async move {
            match request.await {
                Ok(data) => handler.store(&affinity_type, data),
                Err(e) => {
                    tracing::warn!(affinity = %affinity_type, error = %e, "TRA subscribe failed");
                    handler.subscribed.borrow_mut().remove(&affinity_type);
                }
            }
        });
    }

    /// Record `key -> host` and publish it. Nothing is sent when the cache
    /// already holds that exact mapping.
    pub fn update(self: &Rc<Self>, affinity_type: &str, key: &str, host: &str, context: QueryContext) {
        if self.cache.get(affinity_type, key).as_deref() == Some(host) {
            return;
        }
        self.cache.insert(affinity_type, key, host);

        tracing::debug!(affinity = %affinity_type, key = %key, host = %host, "Publishing TRA mapping");
        let data = TraData::from([(key.to_string(), host.to_string())]);
        let request = self.client.update(affinity_type, &data, &context);
        let affinity_type = affinity_type.to_string();
        tokio::task::spawn_local(async move {
            if let Err(e) = request.await {
                tracing::warn!(affinity = %affinity_type, error = %e, "TRA update failed");
            }
        });
    }

    /// Evict `key` and withdraw it from the service.
    pub fn delete(self: &Rc<Self>, affinity_type: &str, key: &str, context: QueryContext) {
        if let Some(host) = self.cache.remove(affinity_type, key) {
            tracing::debug!(affinity = %affinity_type, key = %key, host = %host, "Evicted TRA mapping");
        }

        let request = self.client.delete(affinity_type, key, &context);
        let (affinity_type, key) = (affinity_type.to_string(), key.to_string());
        tokio::task::spawn_local(async move {
            if let Err(e) = request.await {
                tracing::warn!(affinity = %affinity_type, key = %key, error = %e, "TRA delete failed");
            }
        });
    }

    /// Identity sent along with queries from `transaction_id`.
    pub fn context(&self, transaction_id: &str) -> QueryContext {
        QueryContext {
            thread_id: self.thread_id.clone(),
            transaction_id: transaction_id.to_string(),
        }
    }

    fn store(&self, affinity_type: &str, data: TraData) {
        for (key, value) in data {
            if !value.is_empty() {
                self.cache.insert(affinity_type, key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use futures_util::future::{self, FutureExt, LocalBoxFuture};

    use super::*;

    #[derive(Default)]
    struct RecordingClient {
        updates: RefCell<Vec<(String, TraData)>>,
        deletes: RefCell<Vec<(String, String)>>,
    }

    impl TraClient for RecordingClient {
        fn retrieve(&self, _: &str, _: &str, _: &QueryContext) -> LocalBoxFuture<'static, TraResult<TraData>> {
            future::ready(Ok(TraData::new())).boxed_local()
        }

        fn subscribe(&self, _: &str) -> LocalBoxFuture<'static, TraResult<TraData>> {
            future::ready(Ok(TraData::new())).boxed_local()
        }

        fn update(&self, affinity_type: &str, data: &TraData, _: &QueryContext) -> LocalBoxFuture<'static, TraResult<()>> {
            self.updates
                .borrow_mut()
                .push((affinity_type.to_string(), data.clone()));
            future::ready(Ok(())).boxed_local()
        }

        fn delete(&self, affinity_type: &str, key: &str, _: &QueryContext) -> LocalBoxFuture<'static, TraResult<()>> {
            self.deletes
                .borrow_mut()
                .push((affinity_type.to_string(), key.to_string()));
            future::ready(Ok(())).boxed_local()
        }
    }

    fn handler() -> (Rc<TraHandler>, Rc<RecordingClient>) {
        let client = Rc::new(RecordingClient::default());
        let handler = Rc::new(TraHandler::new(
            "worker-0",
            client.clone(),
            Arc::new(TraCache::new(100)),
            Rc::new(PendingList::new()),
        ));
        (handler, client)
    }

    #[tokio::test]
    async fn test_update_caches_and_publishes_once() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (handler, client) = handler();
                let context = handler.context("z9hG4bK-1");

                handler.update("lskpmc", "S1F1", "10.0.0.1", context.clone());
                handler.update("lskpmc", "S1F1", "10.0.0.1", context.clone());
                tokio::task::yield_now().await;

                assert_eq!(handler.cache().get("lskpmc", "S1F1").as_deref(), Some("10.0.0.1"));
                let updates = client.updates.borrow();
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].0, "lskpmc");
                assert_eq!(updates[0].1.get("S1F1").map(String::as_str), Some("10.0.0.1"));
                drop(updates);

                handler.update("lskpmc", "S1F1", "10.0.0.2", context);
                assert_eq!(handler.cache().get("lskpmc", "S1F1").as_deref(), Some("10.0.0.2"));
                assert_eq!(client.updates.borrow().len(), 2);
            })
            .await;
    }

    #[tokio::test]
    async fn test_delete_evicts_and_withdraws() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (handler, client) = handler();
                handler.cache().insert("lskpmc", "S1F1", "10.0.0.1");

                handler.delete("lskpmc", "S1F1", handler.context("z9hG4bK-1"));

                assert_eq!(handler.cache().get("lskpmc", "S1F1"), None);
                assert_eq!(
                    client.deletes.borrow().as_slice(),
                    &[("lskpmc".to_string(), "S1F1".to_string())]
                );
            })
            .await;
    }
}
