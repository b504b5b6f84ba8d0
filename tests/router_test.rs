//! Router state machine tests against fake clusters and callbacks.

use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing_test::traced_test;

use sip_router::cluster::{ClusterInfo, PoolFailureReason};
use sip_router::config::schema::AffinityEntryConfig;
use sip_router::config::ProtocolOptionsConfig;
use sip_router::error::RouterError;
use sip_router::router::{
    ConnectionState, FilterStatus, ResumeAction, Router, ThreadLocalTransactionInfo, UpstreamConnection,
};
use sip_router::sip::{encoder, HeaderType, Operation};
use sip_router::tra::{TraCache, TraHandler};

mod common;

use common::{decode, invite, request, response, FakeTraClient, Harness, PoolMode, RecordingCallbacks, CLUSTER, DOMAIN};

fn upstream_options() -> ProtocolOptionsConfig {
    let mut options = ProtocolOptionsConfig::default();
    options.upstream_transactions.enabled = true;
    options
}

/// Run a downstream INVITE through every stage on a ready pool.
fn forward_invite(harness: &Harness, callbacks: Rc<RecordingCallbacks>, branch: &str) -> Router {
    forward_message(harness, callbacks, &invite(branch))
}

fn forward_message(harness: &Harness, callbacks: Rc<RecordingCallbacks>, message: &str) -> Router {
    let mut router = harness.router(callbacks);
    let metadata = decode(message);
    assert_eq!(router.transport_begin(metadata.clone()).unwrap(), FilterStatus::Continue);
    assert_eq!(router.message_begin(metadata).unwrap(), FilterStatus::Continue);
    router.message_end().unwrap();
    router.transport_end().unwrap();
    router
}

fn upstream_request(branch: &str, origin: &str) -> String {
    request(
        "INVITE",
        branch,
        "<sip:pcsf.example.com;lr>",
        &[&format!("X-Envoy-Origin-Ingress: {}", origin)],
    )
}

#[test]
fn test_upstream_request_delivered_to_downstream() {
    let harness = Harness::new(upstream_options());
    let downstream = harness.callbacks("xyz");
    harness.downstream.insert("xyz", downstream.clone());

    let callbacks = harness.callbacks("t1");
    let _router = forward_invite(&harness, callbacks, "t1");

    let written = harness.pool(0).transport.written();
    assert_eq!(written.len(), 1);
    assert!(written[0].contains("X-Envoy-Origin-Ingress: thread=worker-0; downstream-connection=abc\r\n"));

    let message = upstream_request("up-1", "thread=worker-0; downstream-connection=xyz");
    harness.pool(0).transport.deliver(&message);

    let delivered = downstream.delivered.borrow();
    assert_eq!(delivered.len(), 1);
    let (metadata, return_destination) = &delivered[0];
    assert_eq!(return_destination.as_deref(), Some("10.0.0.1"));

    let metadata = metadata.borrow();
    let deletes: Vec<_> = metadata
        .operation_list()
        .iter()
        .filter(|op| matches!(op, Operation::Delete { .. }))
        .collect();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].position(), message.find("X-Envoy-Origin-Ingress").unwrap());
    assert!(metadata.list_header(HeaderType::XEnvoyOriginIngress).is_empty());

    let encoded = encoder::encode(&metadata);
    assert!(!String::from_utf8_lossy(&encoded).contains("X-Envoy-Origin-Ingress"));
}

#[test]
fn test_outbound_origin_ingress_replaced() {
    let harness = Harness::new(upstream_options());
    let message = request(
        "INVITE",
        "t1",
        &format!("<sip:{DOMAIN};lr>"),
        &[
            "X-Envoy-Origin-Ingress: thread=worker-9; downstream-connection=stale",
            "Max-Forwards: 70",
            "X-Envoy-Origin-Ingress: thread=worker-8; downstream-connection=older",
        ],
    );
    let _router = forward_message(&harness, harness.callbacks("t1"), &message);

    let written = harness.pool(0).transport.written();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].matches("X-Envoy-Origin-Ingress").count(), 1);
    assert!(written[0].contains("X-Envoy-Origin-Ingress: thread=worker-0; downstream-connection=abc\r\n"));
    assert!(!written[0].contains("worker-9"));
    assert!(!written[0].contains("worker-8"));
    assert!(written[0].contains("Max-Forwards: 70\r\n"));
    assert!(written[0].ends_with("downstream-connection=abc\r\n\r\n"));
}

#[test]
fn test_origin_ingress_untouched_when_disabled() {
    let harness = Harness::new(ProtocolOptionsConfig::default());
    let message = request(
        "INVITE",
        "t1",
        &format!("<sip:{DOMAIN};lr>"),
        &["X-Envoy-Origin-Ingress: thread=worker-9; downstream-connection=stale"],
    );
    let _router = forward_message(&harness, harness.callbacks("t1"), &message);

    let written = harness.pool(0).transport.written();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0], message);
}

#[test]
#[traced_test]
fn test_upstream_request_wrong_thread() {
    let harness = Harness::new(upstream_options());
    let downstream = harness.callbacks("xyz");
    harness.downstream.insert("xyz", downstream.clone());
    let _router = forward_invite(&harness, harness.callbacks("t1"), "t1");

    harness
        .pool(0)
        .transport
        .deliver(&upstream_request("up-1", "thread=worker-7; downstream-connection=xyz"));

    assert!(downstream.delivered.borrow().is_empty());
    assert!(logs_contain("Thread ID error received different from local thread ID"));
    assert_eq!(harness.stats.get("upstream_request_dropped"), 1);
}

#[test]
#[traced_test]
fn test_upstream_request_missing_header() {
    let harness = Harness::new(upstream_options());
    let downstream = harness.callbacks("xyz");
    harness.downstream.insert("xyz", downstream.clone());
    let _router = forward_invite(&harness, harness.callbacks("t1"), "t1");

    harness
        .pool(0)
        .transport
        .deliver(&request("NOTIFY", "up-1", "<sip:pcsf.example.com;lr>", &[]));

    assert!(downstream.delivered.borrow().is_empty());
    assert!(logs_contain("Dropping upstream request with no X-Envoy-Origin-Ingress header"));
}

#[test]
#[traced_test]
fn test_upstream_request_malformed_header() {
    let harness = Harness::new(upstream_options());
    let downstream = harness.callbacks("xyz");
    harness.downstream.insert("xyz", downstream.clone());
    let _router = forward_invite(&harness, harness.callbacks("t1"), "t1");

    harness
        .pool(0)
        .transport
        .deliver(&upstream_request("up-1", "downstream-connection=xyz"));

    assert!(downstream.delivered.borrow().is_empty());
    assert!(logs_contain("invalid format of X-Envoy-Origin-Ingress header"));
}

#[test]
#[traced_test]
fn test_upstream_request_unknown_downstream_connection() {
    let harness = Harness::new(upstream_options());
    let _router = forward_invite(&harness, harness.callbacks("t1"), "t1");

    harness
        .pool(0)
        .transport
        .deliver(&upstream_request("up-1", "thread=worker-0; downstream-connection=gone"));

    assert!(logs_contain("No downstream connection found for gone"));
    assert_eq!(harness.stats.get("upstream_request_dropped"), 1);
}

#[test]
fn test_upstream_request_disabled_gets_local_reply() {
    let harness = Harness::new(ProtocolOptionsConfig::default());
    let downstream = harness.callbacks("xyz");
    harness.downstream.insert("xyz", downstream.clone());
    let _router = forward_invite(&harness, harness.callbacks("t1"), "t1");

    let written = harness.pool(0).transport.written();
    assert!(!written[0].contains("X-Envoy-Origin-Ingress"));

    harness
        .pool(0)
        .transport
        .deliver(&upstream_request("up-1", "thread=worker-0; downstream-connection=xyz"));

    assert!(downstream.delivered.borrow().is_empty());
    let written = harness.pool(0).transport.written();
    assert_eq!(written.len(), 2);
    assert!(written[1].starts_with("SIP/2.0 503 Service Unavailable\r\n"));
    assert!(written[1].contains("Reason: Upstream transactions not supported\r\n"));
    assert_eq!(harness.stats.get("local_generated_response"), 1);
}

#[test]
fn test_upstream_response_reaches_transaction() {
    let harness = Harness::new(ProtocolOptionsConfig::default());
    let callbacks = harness.callbacks("t1");
    let _router = forward_invite(&harness, callbacks.clone(), "t1");

    harness
        .pool(0)
        .transport
        .deliver(&response(200, "OK", "t1", "INVITE"));
    harness
        .pool(0)
        .transport
        .deliver(&response(200, "OK", "unknown", "INVITE"));

    let delivered = callbacks.delivered.borrow();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0.borrow().status_code(), Some(200));
    assert_eq!(delivered[0].1, None);
    assert_eq!(harness.stats.get("upstream_request"), 1);
}

#[test]
fn test_call_no_cluster() {
    let harness = Harness::new(ProtocolOptionsConfig::default());
    let route = Arc::new(sip_router::routing::RouteEntry::new("r", DOMAIN, "Route", "host", "unknown"));
    let mut router = harness.router(harness.callbacks_with_route("t1", Some(route)));

    let err = router.transport_begin(decode(&invite("t1"))).unwrap_err();
    assert_eq!(err, RouterError::UnknownCluster("unknown".to_string()));
    assert_eq!(harness.stats.get("unknown_cluster"), 1);
}

#[test]
fn test_route_missing() {
    let harness = Harness::new(ProtocolOptionsConfig::default());
    let mut router = harness.router(harness.callbacks_with_route("t1", None));

    let err = router.transport_begin(decode(&invite("t1"))).unwrap_err();
    assert_eq!(err, RouterError::RouteMissing);
    assert_eq!(harness.stats.get("route_missing"), 1);
}

#[test]
fn test_maintenance_mode() {
    let info = ClusterInfo {
        maintenance_mode: true,
        ..ClusterInfo::new(CLUSTER, ProtocolOptionsConfig::default())
    };
    let harness = Harness::build(info, &["10.0.0.1:5060"], PoolMode::Ready);
    let mut router = harness.router(harness.callbacks("t1"));

    let err = router.transport_begin(decode(&invite("t1"))).unwrap_err();
    assert_eq!(err, RouterError::MaintenanceMode(CLUSTER.to_string()));
    assert_eq!(harness.stats.get("upstream_rq_maintenance_mode"), 1);
}

#[test]
fn test_no_healthy_upstream() {
    let harness = Harness::with_hosts(ProtocolOptionsConfig::default(), &[], PoolMode::Ready);
    let mut router = harness.router(harness.callbacks("t1"));
    let metadata = decode(&invite("t1"));

    router.transport_begin(metadata.clone()).unwrap();
    let err = router.message_begin(metadata).unwrap_err();
    assert_eq!(err, RouterError::NoHealthyUpstream(CLUSTER.to_string()));
    assert_eq!(harness.stats.get("no_healthy_upstream"), 1);
}

#[test]
fn test_stop_load_balance_without_candidates() {
    let mut options = ProtocolOptionsConfig::default();
    options.customized_affinity.stop_load_balance = true;
    let harness = Harness::new(options);
    let mut router = harness.router(harness.callbacks("t1"));
    let metadata = decode(&invite("t1"));

    router.transport_begin(metadata.clone()).unwrap();
    let err = router.message_begin(metadata.clone()).unwrap_err();
    assert_eq!(err, RouterError::AffinityExhausted);
    assert_eq!(metadata.borrow().affinity().len(), 0);
    assert_eq!(harness.pool(0).requests(), 0);
}

#[test]
fn test_session_affinity_pins_endpoint() {
    let mut options = ProtocolOptionsConfig::default();
    options.session_affinity = true;
    let harness = Harness::with_hosts(options, &["10.0.0.1:5060", "10.0.0.2:5060"], PoolMode::Ready);
    let mut router = harness.router(harness.callbacks("t1"));
    let metadata = decode(&request("INVITE", "t1", &format!("<sip:{DOMAIN};lr;ep=10.0.0.2>"), &[]));

    router.transport_begin(metadata.clone()).unwrap();
    assert_eq!(metadata.borrow().affinity().len(), 1);
    assert_eq!(router.message_begin(metadata.clone()).unwrap(), FilterStatus::Continue);
    router.transport_end().unwrap();

    assert_eq!(metadata.borrow().destination(), Some("10.0.0.2"));
    assert_eq!(router.upstream_connection().unwrap().host_key(), "10.0.0.2");
    assert!(harness.pool(0).transport.written().is_empty());
    assert_eq!(harness.pool(1).transport.written().len(), 1);
}

#[test]
fn test_connecting_pool_pauses_and_shares_connection() {
    let harness = Harness::with_hosts(ProtocolOptionsConfig::default(), &["10.0.0.1:5060"], PoolMode::Pending);

    let first = harness.callbacks("t1");
    let mut router1 = harness.router(first.clone());
    let metadata1 = decode(&invite("t1"));
    router1.transport_begin(metadata1.clone()).unwrap();
    assert_eq!(router1.message_begin(metadata1.clone()).unwrap(), FilterStatus::StopIteration);
    assert_eq!(
        *first.pending.borrow(),
        vec![("connection_pending".to_string(), "10.0.0.1".to_string())]
    );

    let second = harness.callbacks("t2");
    let mut router2 = harness.router(second.clone());
    let metadata2 = decode(&invite("t2"));
    router2.transport_begin(metadata2.clone()).unwrap();
    assert_eq!(router2.message_begin(metadata2.clone()).unwrap(), FilterStatus::StopIteration);
    assert_eq!(harness.pool(0).requests(), 1);
    assert_eq!(harness.pending_list.waiting("connection_pending", "10.0.0.1"), 2);

    harness.pool(0).complete();
    assert_eq!(*first.continued.borrow(), vec![("10.0.0.1".to_string(), false)]);

    assert_eq!(router1.message_begin(metadata1).unwrap(), FilterStatus::Continue);
    router1.transport_end().unwrap();
    assert_eq!(router2.message_begin(metadata2).unwrap(), FilterStatus::Continue);
    router2.transport_end().unwrap();

    let written = harness.pool(0).transport.written();
    assert_eq!(written.len(), 2);
    assert!(written[0].contains("branch=t1"));
    assert!(written[1].contains("branch=t2"));
    assert_eq!(harness.tinfo.upstream_connection_count(), 1);
}

#[test]
fn test_pool_failure_requests_next_affinity() {
    let harness = Harness::with_hosts(
        ProtocolOptionsConfig::default(),
        &["10.0.0.1:5060"],
        PoolMode::Fail(PoolFailureReason::RemoteConnectionFailure),
    );

    for branch in ["t1", "t2", "t3"] {
        let callbacks = harness.callbacks(branch);
        let mut router = harness.router(callbacks.clone());
        let metadata = decode(&invite(branch));
        router.transport_begin(metadata.clone()).unwrap();
        assert_eq!(router.message_begin(metadata).unwrap(), FilterStatus::StopIteration);
        assert_eq!(*callbacks.continued.borrow(), vec![("10.0.0.1".to_string(), true)]);
    }

    assert!(!harness.pool(0).host.is_healthy());
}

#[test]
fn test_pool_overflow_is_an_error() {
    let harness = Harness::with_hosts(
        ProtocolOptionsConfig::default(),
        &["10.0.0.1:5060"],
        PoolMode::Fail(PoolFailureReason::Overflow),
    );
    let mut router = harness.router(harness.callbacks("t1"));
    let metadata = decode(&invite("t1"));

    router.transport_begin(metadata.clone()).unwrap();
    let err = router.message_begin(metadata).unwrap_err();
    assert_eq!(err, RouterError::Overflow("10.0.0.1".to_string()));
    assert!(harness.pool(0).host.is_healthy());
}

#[test]
fn test_pending_connection_failure() {
    let harness = Harness::with_hosts(ProtocolOptionsConfig::default(), &["10.0.0.1:5060"], PoolMode::Pending);
    let callbacks = harness.callbacks("t1");
    let mut router = harness.router(callbacks.clone());
    let metadata = decode(&invite("t1"));

    router.transport_begin(metadata.clone()).unwrap();
    router.message_begin(metadata).unwrap();
    harness.pool(0).fail(PoolFailureReason::Timeout);

    assert_eq!(*callbacks.continued.borrow(), vec![("10.0.0.1".to_string(), true)]);
    assert_eq!(
        router.upstream_connection().unwrap().state(),
        ConnectionState::NotConnected
    );
}

#[test]
fn test_upstream_connection_reset() {
    let harness = Harness::new(ProtocolOptionsConfig::default());
    let pool = harness.pool(0).clone();
    let connection = UpstreamConnection::new(
        pool.clone(),
        pool.host.clone(),
        Arc::new(ClusterInfo::new(CLUSTER, ProtocolOptionsConfig::default())),
        &harness.tinfo,
        harness.callbacks("t1"),
        harness.stats.clone(),
    );

    assert_eq!(
        connection.on_reset_stream(PoolFailureReason::Overflow),
        Err(RouterError::Overflow("10.0.0.1".to_string()))
    );
    assert!(connection.on_reset_stream(PoolFailureReason::LocalConnectionFailure).is_ok());
    assert!(connection.on_reset_stream(PoolFailureReason::RemoteConnectionFailure).is_ok());
    assert!(connection.on_reset_stream(PoolFailureReason::Timeout).is_ok());
}

#[test]
fn test_upstream_connection_does_not_keep_table_alive() {
    let harness = Harness::new(ProtocolOptionsConfig::default());
    let pool = harness.pool(0).clone();
    let table = Rc::new(ThreadLocalTransactionInfo::new(CLUSTER, Duration::from_secs(32)));
    let connection = UpstreamConnection::new(
        pool.clone(),
        pool.host.clone(),
        Arc::new(ClusterInfo::new(CLUSTER, ProtocolOptionsConfig::default())),
        &table,
        harness.callbacks("t1"),
        harness.stats.clone(),
    );
    table.insert_upstream_connection("10.0.0.1", connection.clone());

    let weak_table = Rc::downgrade(&table);
    let weak_connection = Rc::downgrade(&connection);
    drop(connection);
    drop(table);
    assert!(weak_table.upgrade().is_none());
    assert!(weak_connection.upgrade().is_none());
}

#[test]
fn test_transaction_audit() {
    let harness = Harness::new(ProtocolOptionsConfig::default());
    let expiring = harness.callbacks("t1");
    let _router1 = forward_invite(&harness, expiring.clone(), "t1");
    let destroyed = harness.callbacks("t2");
    let mut router2 = forward_invite(&harness, destroyed.clone(), "t2");
    assert_eq!(harness.tinfo.transaction_count(), 2);

    router2.on_destroy();
    harness.tinfo.audit_timer_action(Instant::now());
    assert_eq!(harness.tinfo.transaction_count(), 1);
    assert_eq!(destroyed.resets.get(), 0);

    let later = Instant::now() + Duration::from_secs(60);
    harness.tinfo.audit_timer_action(later);
    harness.tinfo.audit_timer_action(later);
    assert_eq!(harness.tinfo.transaction_count(), 0);
    assert_eq!(expiring.resets.get(), 1);
    assert_eq!(harness.tinfo.upstream_connection_count(), 1);

    harness.pool(0).transport.remote_close();
    harness.tinfo.audit_timer_action(later);
    assert_eq!(harness.tinfo.upstream_connection_count(), 0);
}

#[tokio::test]
async fn test_tra_query_resumes_transaction() {
    let mut options = ProtocolOptionsConfig::default();
    options.customized_affinity.entries.push(AffinityEntryConfig {
        header: "Route".to_string(),
        key_name: "lskpmc".to_string(),
        query: true,
        subscribe: false,
    });

    let mut harness = Harness::with_hosts(options, &["10.0.0.1:5060", "10.0.0.2:5060"], PoolMode::Ready);
    let client = Rc::new(FakeTraClient::default());
    client.answer("lskpmc", "S1F1", "10.0.0.2");
    harness.tra = Some(Rc::new(TraHandler::new(
        common::THREAD_ID,
        client.clone(),
        Arc::new(TraCache::new(100)),
        harness.pending_list.clone(),
    )));

    let route = format!("<sip:{DOMAIN};lr;lskpmc=S1F1>");
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let callbacks = harness.callbacks("t1");
            let mut router = harness.router(callbacks.clone());
            let metadata = decode(&request("INVITE", "t1", &route, &[]));

            router.transport_begin(metadata.clone()).unwrap();
            assert_eq!(router.message_begin(metadata.clone()).unwrap(), FilterStatus::StopIteration);
            assert_eq!(
                *callbacks.pending.borrow(),
                vec![("lskpmc".to_string(), "S1F1".to_string())]
            );

            for _ in 0..10 {
                if !callbacks.resumes.resumed.borrow().is_empty() {
                    break;
                }
                tokio::task::yield_now().await;
            }
            assert_eq!(
                *callbacks.resumes.resumed.borrow(),
                vec![("t1".to_string(), ResumeAction::Resolved("10.0.0.2".to_string()))]
            );

            metadata.borrow_mut().set_destination("10.0.0.2");
            assert_eq!(router.message_begin(metadata).unwrap(), FilterStatus::Continue);
            assert_eq!(router.upstream_connection().unwrap().host_key(), "10.0.0.2");

            // Second lookup is served from the cache.
            let mut router = harness.router(harness.callbacks("t2"));
            let metadata = decode(&request("INVITE", "t2", &route, &[]));
            router.transport_begin(metadata.clone()).unwrap();
            assert_eq!(router.message_begin(metadata.clone()).unwrap(), FilterStatus::Continue);
            assert_eq!(metadata.borrow().destination(), Some("10.0.0.2"));
        })
        .await;

    assert_eq!(client.retrieves.get(), 1);
}

#[tokio::test]
async fn test_cookie_ip_mapping_published() {
    let mut harness = Harness::with_hosts(ProtocolOptionsConfig::default(), &["10.0.0.1:5060"], PoolMode::Ready);
    let client = Rc::new(FakeTraClient::default());
    let cache = Arc::new(TraCache::new(100));
    harness.tra = Some(Rc::new(TraHandler::new(
        common::THREAD_ID,
        client.clone(),
        cache.clone(),
        harness.pending_list.clone(),
    )));

    let message = request(
        "INVITE",
        "t1",
        &format!("<sip:{DOMAIN};lr>"),
        &["P-Nokia-Cookie-IP-Mapping: S1F1=10.0.0.1"],
    );
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            for branch in ["t1", "t2"] {
                let mut router = harness.router(harness.callbacks(branch));
                let metadata = decode(&message.replace("branch=t1", &format!("branch={branch}")));
                assert_eq!(router.transport_begin(metadata).unwrap(), FilterStatus::Continue);
            }
            tokio::task::yield_now().await;
        })
        .await;

    assert_eq!(cache.get("lskpmc", "S1F1").as_deref(), Some("10.0.0.1"));
    let updates = client.updates.borrow();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, "lskpmc");
    assert_eq!(updates[0].1.get("S1F1").map(String::as_str), Some("10.0.0.1"));
}
