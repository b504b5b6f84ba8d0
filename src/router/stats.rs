//! Router counters.
//!
//! Each counter is kept locally (so tests can read it back) and mirrored
//! to the `metrics` facade as `sip_router_events_total{prefix, stat}`.

use dashmap::DashMap;

pub const ROUTE_MISSING: &str = "route_missing";
pub const UNKNOWN_CLUSTER: &str = "unknown_cluster";
pub const UPSTREAM_RQ_MAINTENANCE_MODE: &str = "upstream_rq_maintenance_mode";
pub const NO_HEALTHY_UPSTREAM: &str = "no_healthy_upstream";
pub const UPSTREAM_REQUEST: &str = "upstream_request";
pub const UPSTREAM_RESPONSE: &str = "upstream_response";
pub const UPSTREAM_REQUEST_DROPPED: &str = "upstream_request_dropped";
pub const DOWNSTREAM_RESPONSE_ERROR: &str = "downstream_response_error";
pub const LOCAL_GENERATED_RESPONSE: &str = "local_generated_response";

#[derive(Debug)]
pub struct RouterStats {
    prefix: String,
    counters: DashMap<&'static str, u64>,
}

impl RouterStats {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counters: DashMap::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn inc(&self, stat: &'static str) {
        *self.counters.entry(stat).or_insert(0) += 1;
        metrics::counter!(
            "sip_router_events_total",
            "prefix" => self.prefix.clone(),
            "stat" => stat
        )
        .increment(1);
    }

    pub fn get(&self, stat: &str) -> u64 {
        self.counters.get(stat).map(|v| *v).unwrap_or(0)
    }
}

impl Default for RouterStats {
    fn default() -> Self {
        Self::new("sip")
    }
}
