//! Dispatcher tests over a real echo child: breaker gating, auto-start,
//! and response id rewriting.

mod common;

use common::{cat_server, harness, server_config};
use mcp_router::proxy::Dispatcher;
use mcp_router::registry::ServerStatus;
use mcp_router::resilience::CircuitBreakerRegistry;
use mcp_router::types::JsonRpcRequest;
use mcp_router::Error;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn request(method: &str, id: u64) -> JsonRpcRequest {
    serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": {"x": 1},
    }))
    .unwrap()
}

fn dispatcher_for(h: &common::TestHarness) -> (Arc<CircuitBreakerRegistry>, Dispatcher) {
    let breakers = Arc::new(CircuitBreakerRegistry::default());
    let dispatcher = Dispatcher::new(h.registry.clone(), h.supervisor.clone(), breakers.clone());
    (breakers, dispatcher)
}

#[tokio::test]
async fn dispatch_round_trip_rewrites_the_caller_id() {
    let h = harness(Duration::from_secs(10));
    h.registry.add(cat_server("echo", false)).unwrap();
    h.supervisor.start_server("echo").await.unwrap();

    let (breakers, dispatcher) = dispatcher_for(&h);

    let response = dispatcher.dispatch("echo", request("tools/list", 42)).await.unwrap();
    // cat echoes the outgoing frame; the dispatcher restores our id over
    // the bridge-allocated one
    assert_eq!(response["id"], json!(42));
    assert_eq!(response["method"], "tools/list");
    assert_eq!(response["params"], json!({"x": 1}));

    let stats = breakers.get("echo").stats();
    assert_eq!(stats.total_successes, 1);
    assert_eq!(stats.total_failures, 0);

    h.supervisor.stop().await;
}

#[tokio::test]
async fn dispatch_auto_starts_configured_servers() {
    let h = harness(Duration::from_secs(10));
    h.registry.add(cat_server("lazy", true)).unwrap();

    let (_breakers, dispatcher) = dispatcher_for(&h);
    assert_eq!(
        h.registry.get_process_info("lazy").unwrap().status,
        ServerStatus::Stopped
    );

    let response = dispatcher.dispatch("lazy", request("ping", 7)).await.unwrap();
    assert_eq!(response["id"], json!(7));
    assert_eq!(
        h.registry.get_process_info("lazy").unwrap().status,
        ServerStatus::Running
    );

    h.supervisor.stop().await;
}

#[tokio::test]
async fn dispatch_rejections() {
    let h = harness(Duration::from_secs(10));
    h.registry.add(cat_server("idle", false)).unwrap();
    h.registry
        .add(server_config(
            "remote",
            json!({
                "package": "test/http",
                "transport": "http",
                "url": "http://localhost:9999",
            }),
        ))
        .unwrap();

    let (breakers, dispatcher) = dispatcher_for(&h);

    // Unknown server
    assert!(matches!(
        dispatcher.dispatch("ghost", request("ping", 1)).await,
        Err(Error::ServerNotFound(_))
    ));

    // Stopped without auto_start
    assert!(matches!(
        dispatcher.dispatch("idle", request("ping", 1)).await,
        Err(Error::Conflict(_))
    ));

    // HTTP transport is not bridged
    assert!(matches!(
        dispatcher.dispatch("remote", request("ping", 1)).await,
        Err(Error::Conflict(_))
    ));

    // Open breaker short-circuits before any process work
    for _ in 0..3 {
        breakers.get("idle").record_failure();
    }
    let err = dispatcher.dispatch("idle", request("ping", 1)).await.unwrap_err();
    match err {
        Error::CircuitOpen {
            name, retry_after, ..
        } => {
            assert_eq!(name, "idle");
            assert!(retry_after.unwrap() > 0.0);
        },
        other => panic!("unexpected error: {other:?}"),
    }

    h.supervisor.stop().await;
}
