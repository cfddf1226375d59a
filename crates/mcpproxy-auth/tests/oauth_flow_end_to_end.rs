//! End-to-end exercise of the OAuth flow coordinator against a mock
//! authorization server: discovery, DCR, PKCE/resource-carrying authorize
//! URL, token exchange, and token reuse after a simulated restart.

use std::sync::Arc;
use std::time::Duration;

use mcpproxy_auth::{
    BrowserLauncher, InMemoryTokenStore, OAuthFlowCoordinator, RecordingLauncher, ServerAuthConfig,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_authorization_server(server: &MockServer) {
    let metadata = json!({
        "issuer": server.uri(),
        "authorization_endpoint": format!("{}/authorize", server.uri()),
        "token_endpoint": format!("{}/token", server.uri()),
        "registration_endpoint": format!("{}/register", server.uri()),
        "scopes_supported": ["mcp:tools"],
    });
    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-authorization-server"))
        .respond_with(ResponseTemplate::new(200).set_body_json(metadata))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/register"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "client_id": "dcr-client-abc",
            "client_secret": "dcr-secret-xyz",
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "access-token-1",
            "refresh_token": "refresh-token-1",
            "token_type": "Bearer",
            "expires_in": 3600,
            "scope": "mcp:tools",
        })))
        .mount(server)
        .await;
}

/// Parses `name=value` out of a URL's query string without pulling in
/// `url` as a dev-dependency of this test — the crate already depends on
/// it, but the authorize URL is plain ASCII and this keeps the test
/// self-contained.
fn query_param<'a>(url: &'a str, name: &str) -> Option<&'a str> {
    let query = url.split_once('?')?.1;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then_some(v)
    })
}

/// Connects to the coordinator's callback listener and delivers a redirect
/// carrying `code`/`state`, simulating the browser completing the
/// authorization-server round trip.
async fn deliver_callback(port: u16, code: &str, state: &str) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect to callback");
    let request = format!("GET /callback?code={code}&state={state} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n");
    stream.write_all(request.as_bytes()).await.expect("write callback request");
    let mut buf = [0u8; 256];
    let _ = stream.read(&mut buf).await;
}

#[tokio::test]
async fn discovery_dcr_and_token_exchange_round_trip_then_reuses_stored_token() {
    let server = MockServer::start().await;
    mount_authorization_server(&server).await;

    let store = Arc::new(InMemoryTokenStore::new());
    let launcher = Arc::new(RecordingLauncher::default());
    let coordinator = Arc::new(OAuthFlowCoordinator::new(store.clone(), launcher.clone()));

    let config = ServerAuthConfig {
        server_name: "acme".to_string(),
        resource: "https://acme.example.com/mcp".to_string(),
        configured_scopes: vec![],
        issuer: Some(server.uri()),
        preferred_callback_port: None,
        user_client_id: None,
    };

    let coordinator_clone = coordinator.clone();
    let config_clone = config.clone();
    let flow = tokio::spawn(async move { coordinator_clone.ensure_authenticated(&config_clone).await });

    // Poll the recording launcher until the flow has built and "opened" its
    // authorize URL, then play the browser's part of the handshake.
    let authorize_url = loop {
        if let Some(url) = launcher.launched.lock().await.first().cloned() {
            break url;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert_eq!(
        query_param(&authorize_url, "resource").as_deref(),
        Some("https%3A%2F%2Facme.example.com%2Fmcp")
    );
    assert_eq!(query_param(&authorize_url, "code_challenge_method"), Some("S256"));
    let state = query_param(&authorize_url, "state").expect("state present").to_string();
    assert!(!state.is_empty());

    let redirect_uri = query_param(&authorize_url, "redirect_uri").expect("redirect_uri present");
    let decoded = percent_encoding::percent_decode_str(redirect_uri).decode_utf8().unwrap();
    let port: u16 = decoded.rsplit(':').next().unwrap().split('/').next().unwrap().parse().unwrap();

    deliver_callback(port, "test-auth-code", &state).await;

    let token = flow.await.expect("flow task join").expect("flow succeeds");
    assert_eq!(token.access_token, "access-token-1");
    assert_eq!(token.refresh_token.as_deref(), Some("refresh-token-1"));

    // Simulate a process restart: a fresh coordinator over the same
    // persisted store must reuse the token without another browser launch.
    let restarted_launcher = Arc::new(RecordingLauncher::default());
    let restarted = OAuthFlowCoordinator::new(store, restarted_launcher.clone());
    let reused = restarted.ensure_authenticated(&config).await.expect("reuse stored token");
    assert_eq!(reused.access_token, "access-token-1");
    assert!(restarted_launcher.launched.lock().await.is_empty());
}

#[tokio::test]
async fn concurrent_callers_coalesce_into_one_flow_and_one_browser_launch() {
    let server = MockServer::start().await;
    mount_authorization_server(&server).await;

    let store = Arc::new(InMemoryTokenStore::new());
    let launcher = Arc::new(RecordingLauncher::default());
    let coordinator = Arc::new(OAuthFlowCoordinator::new(store, launcher.clone()));

    let config = ServerAuthConfig {
        server_name: "acme".to_string(),
        resource: "https://acme.example.com/mcp".to_string(),
        configured_scopes: vec![],
        issuer: Some(server.uri()),
        preferred_callback_port: None,
        user_client_id: None,
    };

    let mut callers = Vec::new();
    for _ in 0..5 {
        let coordinator = coordinator.clone();
        let config = config.clone();
        callers.push(tokio::spawn(async move { coordinator.ensure_authenticated(&config).await }));
    }

    let authorize_url = loop {
        if let Some(url) = launcher.launched.lock().await.first().cloned() {
            break url;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    let state = query_param(&authorize_url, "state").unwrap().to_string();
    let redirect_uri = query_param(&authorize_url, "redirect_uri").unwrap();
    let decoded = percent_encoding::percent_decode_str(redirect_uri).decode_utf8().unwrap();
    let port: u16 = decoded.rsplit(':').next().unwrap().split('/').next().unwrap().parse().unwrap();
    deliver_callback(port, "shared-code", &state).await;

    let mut tokens = Vec::new();
    for caller in callers {
        tokens.push(caller.await.expect("join").expect("auth succeeds").access_token);
    }
    assert!(tokens.iter().all(|t| t == &tokens[0]));
    assert_eq!(coordinator.active_flows().await.len(), 0);
    assert_eq!(launcher.launched.lock().await.len(), 1, "exactly one browser launch for five coalesced callers");
}
