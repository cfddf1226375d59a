//! End-to-end exercise of the dispatcher against mocked upstream MCP
//! servers: a clean `read` call, an intent/variant mismatch rejected before
//! any upstream traffic, and a write denied because its arguments match a
//! prior read's origin from an internal server into an external one.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcpproxy_core::{
    ActivityType, DynActivityStore, EventBus, FlowTracker, InMemoryActivityStore, IntentDeclaration,
    NoopSensitiveDataDetector, OperationType, ProxyError, ServerConfig, ToolDispatcher, UpstreamManager,
};
use mcpproxy_transport::{TimeoutConfig, TransportKind};

/// Mounts the three JSON-RPC methods a `CoreConnection` actually drives:
/// `initialize`, `tools/list` (advertising one tool) and `tools/call`
/// (always returning `call_result`).
async fn mount_tool_server(server: &MockServer, tool_name: &str, call_result: serde_json::Value) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "protocolVersion": "2024-11-05",
                "serverInfo": {"name": "mock-upstream"},
                "capabilities": {},
            },
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "tools": [{
                    "name": tool_name,
                    "description": null,
                    "input_schema": null,
                    "annotations": {},
                }],
            },
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": call_result,
        })))
        .mount(server)
        .await;
}

fn harness(manager: Arc<UpstreamManager>, activity: DynActivityStore) -> ToolDispatcher {
    let flow_tracker =
        Arc::new(FlowTracker::new(Arc::new(NoopSensitiveDataDetector), None, Some(activity.clone())));
    ToolDispatcher::new(manager, flow_tracker, Some(activity), false, true)
}

async fn wait_for_tool(manager: &UpstreamManager, qualified_name: &str) {
    for _ in 0..250 {
        if manager.find_tool_owner(qualified_name).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{qualified_name} never became available within the wait budget");
}

#[tokio::test]
async fn read_call_reaches_upstream_and_is_recorded_once() {
    let server = MockServer::start().await;
    mount_tool_server(&server, "lookup_widget", json!({"widget": "gizmo"})).await;

    let manager = Arc::new(UpstreamManager::new(
        Arc::new(EventBus::new(16)),
        None,
        TimeoutConfig::default(),
        Duration::from_secs(300),
    ));
    manager.add_server(ServerConfig::new_http("acme", TransportKind::Http, server.uri())).await.unwrap();
    wait_for_tool(&manager, "acme.lookup_widget").await;

    let activity: DynActivityStore = Arc::new(InMemoryActivityStore::new());
    let dispatcher = harness(manager, activity.clone());

    let result = dispatcher
        .call_tool_read(
            "acme.lookup_widget",
            json!({"id": "123"}),
            IntentDeclaration::new(OperationType::Read, "looking up a widget"),
            "session-a",
        )
        .await
        .expect("read call succeeds");
    assert_eq!(result, json!({"widget": "gizmo"}));

    let recorded = activity.list(&[ActivityType::ToolCall], None, 10).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].tool.as_deref(), Some("acme.lookup_widget"));
    assert_eq!(recorded[0].intent_type.as_deref(), Some("read"));
}

#[tokio::test]
async fn declared_intent_must_match_the_dispatch_variant_before_any_upstream_call() {
    let manager = Arc::new(UpstreamManager::new(
        Arc::new(EventBus::new(16)),
        None,
        TimeoutConfig::default(),
        Duration::from_secs(300),
    ));
    let activity: DynActivityStore = Arc::new(InMemoryActivityStore::new());
    let dispatcher = harness(manager, activity.clone());

    // No server is even registered: a mismatched intent must fail at step 1,
    // long before tool resolution would need one to exist.
    let err = dispatcher
        .call_tool_write(
            "acme.delete_widget",
            json!({}),
            IntentDeclaration::new(OperationType::Read, "mislabeled as read"),
            "session-b",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::IntentMismatch { .. }));
    assert!(activity.list(&[], None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn write_reusing_an_internal_read_s_arguments_against_an_external_server_is_denied() {
    let internal = MockServer::start().await;
    mount_tool_server(&internal, "lookup_secret", json!({"found": true})).await;
    let external = MockServer::start().await;
    mount_tool_server(&external, "send_data", json!({"sent": true})).await;

    let manager = Arc::new(UpstreamManager::new(
        Arc::new(EventBus::new(16)),
        None,
        TimeoutConfig::default(),
        Duration::from_secs(300),
    ));
    manager.add_server(ServerConfig::new_http("internal-db", TransportKind::Http, internal.uri())).await.unwrap();
    manager.add_server(ServerConfig::new_http("vendor-api", TransportKind::Http, external.uri())).await.unwrap();
    wait_for_tool(&manager, "internal-db.lookup_secret").await;
    wait_for_tool(&manager, "vendor-api.send_data").await;

    let activity: DynActivityStore = Arc::new(InMemoryActivityStore::new());
    let dispatcher = harness(manager, activity.clone());

    let secret_bearing_args = json!({"secret_token": "abcdefghijklmnopqrstuvwxyz0123456789"});

    dispatcher
        .call_tool_read(
            "internal-db.lookup_secret",
            secret_bearing_args.clone(),
            IntentDeclaration::new(OperationType::Read, "reading internal secret"),
            "session-x",
        )
        .await
        .expect("read from the internal server succeeds");

    let err = dispatcher
        .call_tool_write(
            "vendor-api.send_data",
            secret_bearing_args,
            IntentDeclaration::new(OperationType::Write, "forwarding to vendor"),
            "session-x",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::PolicyDeny(_)), "expected a policy denial, got {err:?}");

    let evaluations = activity.list(&[ActivityType::HookEvaluation], None, 10).await.unwrap();
    let critical = evaluations.iter().find(|r| r.metadata.get("risk") == Some(&json!("Critical")));
    assert!(critical.is_some(), "expected a hook evaluation recorded at critical risk");
    assert_eq!(critical.unwrap().metadata.get("decision"), Some(&json!("Deny")));
}
