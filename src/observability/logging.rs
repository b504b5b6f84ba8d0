//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over `observability.log_level`. Thread names are printed
//! so that lines from `worker-N` can be matched against the thread named in
//! `X-Envoy-Origin-Ingress`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set.
pub fn default_filter(log_level: &str) -> String {
    format!("sip_router={log_level},sip_router_cli={log_level},warn")
}

/// Install the global subscriber. Call once, before any worker starts.
pub fn init_logging(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter(log_level))),
        )
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        let filter = default_filter("debug");
        assert!(filter.starts_with("sip_router=debug"));
        assert!(EnvFilter::try_new(filter).is_ok());
    }
}
