//! Requests initiated by an upstream host.
//!
//! An upstream host may send a new request (a NOTIFY for a subscription,
//! a BYE for a dialog) on the connection the proxy opened. The request
//! carries the `X-Envoy-Origin-Ingress` header the proxy stamped on the
//! original outbound request; it names the worker and the downstream
//! connection to deliver to. Any failed precondition drops the request
//! with an error log.

use crate::error::ErrorCode;
use crate::router::origin_ingress::OriginIngress;
use crate::router::stats::UPSTREAM_REQUEST_DROPPED;
use crate::router::upstream::UpstreamConnection;
use crate::router::ResponseStatus;
use crate::sip::{HeaderType, MessageMetadata, Operation};

impl UpstreamConnection {
    pub(crate) fn handle_upstream_request(&self, mut metadata: MessageMetadata) {
        if !self.cluster_info().options.upstream_transactions.enabled {
            tracing::error!("Upstream transaction support disabled. Dropping upstream request.");
            self.stats().inc(UPSTREAM_REQUEST_DROPPED);
            self.on_error(
                &metadata,
                ErrorCode::ServiceUnavailable,
                "Upstream transactions not supported",
            );
            return;
        }

        let Some(header) = metadata.header(HeaderType::XEnvoyOriginIngress).cloned() else {
            tracing::error!("Dropping upstream request with no X-Envoy-Origin-Ingress header");
            self.stats().inc(UPSTREAM_REQUEST_DROPPED);
            return;
        };

        let origin: OriginIngress = match header.text().parse() {
            Ok(origin) => origin,
            Err(e) => {
                tracing::error!(
                    value = %header.text(),
                    error = %e,
                    "Dropping upstream request with invalid format of X-Envoy-Origin-Ingress header"
                );
                self.stats().inc(UPSTREAM_REQUEST_DROPPED);
                return;
            }
        };

        let downstream_connections = self.callbacks().downstream_connection_infos();
        if origin.thread_id() != downstream_connections.thread_id() {
            tracing::error!(
                received = %origin.thread_id(),
                local = %downstream_connections.thread_id(),
                "Thread ID error received different from local thread ID"
            );
            self.stats().inc(UPSTREAM_REQUEST_DROPPED);
            return;
        }

        let Some(downstream) = downstream_connections.get(origin.downstream_connection_id()) else {
            tracing::error!("No downstream connection found for {}", origin.downstream_connection_id());
            self.stats().inc(UPSTREAM_REQUEST_DROPPED);
            return;
        };

        for header in metadata.remove_headers(HeaderType::XEnvoyOriginIngress) {
            if let Some(position) = header.raw_offset() {
                metadata.set_operation(Operation::Delete {
                    position,
                    length: header.raw_len(),
                });
            }
        }

        let transaction_id = metadata.transaction_id().unwrap_or_default().to_string();
        tracing::debug!(
            transaction_id = %transaction_id,
            downstream_connection = %origin.downstream_connection_id(),
            host = %self.host_key(),
            "Forwarding upstream request downstream"
        );

        let route = self.callbacks().route();
        let status = downstream.upstream_data(
            metadata.into_ref(),
            route,
            Some(self.host_key().to_string()),
        );
        if status == ResponseStatus::Reset {
            tracing::debug!(transaction_id = %transaction_id, "Downstream reset while delivering upstream request");
        }
    }
}
