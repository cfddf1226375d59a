//! Core Connection: handshake, capability probe, notification
//! hub and reconnect decisions over one transport instance.
//!
//! The transport itself is rebuilt rather than mutated when an OAuth
//! challenge is resolved into a fresh bearer token — HTTP-family transports
//! carry their headers in their (immutable) config, so injecting a token
//! means handing the connection a fresh instance built by the same factory
//! the [`crate::managed_client::ManagedClient`] constructed it with.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use mcpproxy_auth::{AuthError, OAuthFlowCoordinator, ServerAuthConfig};
use mcpproxy_protocol::ToolDescriptor;
use mcpproxy_transport::{ExitClass, ProcessExitSignal, TimeoutConfig, Transport, TransportError};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::error::{ProxyError, ProxyResult};

/// Builds a transport instance, optionally carrying a bearer token for the
/// HTTP-family variants. Stdio transports ignore the token argument.
pub type TransportBuilder = Arc<dyn Fn(Option<&str>) -> Arc<dyn Transport> + Send + Sync>;

/// State machine for one upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Opening,
    Handshaking,
    Ready,
    Closing,
    Broken,
}

/// Result of the MCP `initialize` handshake.
#[derive(Debug, Clone)]
pub struct HandshakeResult {
    pub protocol_version: String,
    pub server_name: Option<String>,
    pub capabilities: Value,
}

/// Well-known mapping from a stdio child's exit to a semantic reconnect
/// decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    PortConflict,
    DbLocked,
    ConfigError,
    GeneralError,
}

impl From<ExitClass> for ExitOutcome {
    fn from(class: ExitClass) -> Self {
        match class {
            ExitClass::PortConflict => Self::PortConflict,
            ExitClass::DbLocked => Self::DbLocked,
            ExitClass::ConfigError => Self::ConfigError,
            ExitClass::GeneralError => Self::GeneralError,
        }
    }
}

/// Invoked on the single slot a [`crate::managed_client::ManagedClient`]
/// installs once its connection reaches `ready`.
pub type ToolsChangedCallback = Arc<dyn Fn() + Send + Sync>;

/// One upstream connection's state machine. Owned by exactly one
/// [`crate::managed_client::ManagedClient`]: each enabled server config has
/// exactly one active `CoreConnection` at a time.
pub struct CoreConnection {
    server_name: String,
    resource: String,
    transport_factory: TransportBuilder,
    transport: RwLock<Arc<dyn Transport>>,
    state: RwLock<ConnState>,
    handshake: RwLock<Option<HandshakeResult>>,
    tools: RwLock<Vec<ToolDescriptor>>,
    callback: RwLock<Option<ToolsChangedCallback>>,
    reconnect_backoff: AtomicU32,
    timeout: TimeoutConfig,
    oauth: Option<OAuthBinding>,
}

struct OAuthBinding {
    coordinator: Arc<OAuthFlowCoordinator>,
    config: ServerAuthConfig,
}

impl CoreConnection {
    #[must_use]
    pub fn new(
        server_name: impl Into<String>,
        resource: impl Into<String>,
        transport_factory: TransportBuilder,
        timeout: TimeoutConfig,
        oauth: Option<(Arc<OAuthFlowCoordinator>, ServerAuthConfig)>,
    ) -> Self {
        let initial = transport_factory(None);
        Self {
            server_name: server_name.into(),
            resource: resource.into(),
            transport_factory,
            transport: RwLock::new(initial),
            state: RwLock::new(ConnState::Idle),
            handshake: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            callback: RwLock::new(None),
            reconnect_backoff: AtomicU32::new(0),
            timeout,
            oauth: oauth.map(|(coordinator, config)| OAuthBinding { coordinator, config }),
        }
    }

    pub async fn state(&self) -> ConnState {
        *self.state.read().await
    }

    pub async fn handshake_info(&self) -> Option<HandshakeResult> {
        self.handshake.read().await.clone()
    }

    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().await.clone()
    }

    /// Install the single notification callback slot ("notification
    /// callback slot", mutex-guarded; only ever set by the owning managed
    /// client).
    pub async fn set_tools_changed_callback(&self, callback: ToolsChangedCallback) {
        *self.callback.write().await = Some(callback);
    }

    /// `idle -> opening -> handshaking -> ready`.
    #[instrument(skip(self), fields(server_name = %self.server_name))]
    pub async fn connect(&self) -> ProxyResult<HandshakeResult> {
        *self.state.write().await = ConnState::Opening;
        let transport = self.transport.read().await.clone();
        if let Err(e) = transport.open().await {
            *self.state.write().await = ConnState::Broken;
            return Err(e.into());
        }

        *self.state.write().await = ConnState::Handshaking;
        let result = self.request_with_challenge_retry("initialize", Some(serde_json::json!({
            "protocolVersion": "2024-11-05",
            "clientInfo": { "name": "mcpproxy", "version": env!("CARGO_PKG_VERSION") },
        })))
        .await;

        match result {
            Ok(value) => {
                let handshake = HandshakeResult {
                    protocol_version: value
                        .get("protocolVersion")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    server_name: value
                        .get("serverInfo")
                        .and_then(|s| s.get("name"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    capabilities: value.get("capabilities").cloned().unwrap_or(Value::Null),
                };
                *self.handshake.write().await = Some(handshake.clone());
                *self.state.write().await = ConnState::Ready;
                self.reconnect_backoff.store(0, Ordering::SeqCst);
                info!(server_name = %self.server_name, "connection ready");
                Ok(handshake)
            }
            Err(e) => {
                *self.state.write().await = ConnState::Broken;
                Err(e)
            }
        }
    }

    /// Issue a JSON-RPC request. On a `401`/`OAuthChallenge`, suspend,
    /// resolve through the coordinator, rebuild the transport with the new
    /// token, and retry exactly once.
    pub async fn request(&self, method: &str, params: Option<Value>) -> ProxyResult<Value> {
        self.request_with_challenge_retry(method, params).await
    }

    async fn request_with_challenge_retry(&self, method: &str, params: Option<Value>) -> ProxyResult<Value> {
        let transport = self.transport.read().await.clone();
        match transport.request(method.to_string(), params.clone(), self.timeout).await {
            Ok(value) => Ok(value),
            Err(TransportError::OAuthChallenge { .. }) => {
                self.resolve_challenge_and_swap().await?;
                let transport = self.transport.read().await.clone();
                transport
                    .request(method.to_string(), params, self.timeout)
                    .await
                    .map_err(ProxyError::from)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_challenge_and_swap(&self) -> ProxyResult<()> {
        let Some(oauth) = &self.oauth else {
            *self.state.write().await = ConnState::Broken;
            return Err(ProxyError::Auth(AuthError::AuthRequiredManual));
        };
        match oauth.coordinator.ensure_authenticated(&oauth.config).await {
            Ok(token) => {
                let new_transport = (self.transport_factory)(Some(&token.access_token));
                *self.transport.write().await = new_transport;
                let transport = self.transport.read().await.clone();
                transport.open().await.map_err(ProxyError::from)?;
                Ok(())
            }
            Err(e) => {
                warn!(server_name = %self.server_name, error = %e, "oauth challenge resolution failed");
                *self.state.write().await = ConnState::Broken;
                Err(ProxyError::Auth(e))
            }
        }
    }

    /// Run `tools/list` and publish the result, firing the installed
    /// callback only if the set actually changed (suppresses redundant
    /// notifications from overlapping poll/notification triggers — that
    /// de-duplication lives one layer up in the managed client's
    /// in-progress set).
    pub async fn discover_tools(&self) -> ProxyResult<Vec<ToolDescriptor>> {
        let value = self.request("tools/list", None).await?;
        let tools: Vec<ToolDescriptor> = value
            .get("tools")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ProxyError::Internal(format!("malformed tools/list response: {e}")))?
            .unwrap_or_default();

        let changed = {
            let mut guard = self.tools.write().await;
            let changed = *guard != tools;
            *guard = tools.clone();
            changed
        };
        if changed {
            if let Some(cb) = self.callback.read().await.as_ref() {
                cb();
            }
        }
        Ok(tools)
    }

    /// Pull the next inbound notification and report whether it was a
    /// `tools/list_changed` ("dispatches only `tools/list_changed`
    /// to a single callback slot").
    pub async fn poll_next_notification(&self) -> Option<bool> {
        let transport = self.transport.read().await.clone();
        let message = transport.next_notification().await?;
        let is_tools_changed = serde_json::from_slice::<Value>(&message.payload)
            .ok()
            .and_then(|v| v.get("method").and_then(Value::as_str).map(str::to_string))
            .as_deref()
            == Some("notifications/tools/list_changed");
        Some(is_tools_changed)
    }

    /// Map a stdio transport's observed exit into a reconnect decision
    /// using the well-known exit-code mapping.
    #[must_use]
    pub fn classify_exit(signal: ProcessExitSignal) -> ExitOutcome {
        signal.classify().into()
    }

    /// `ready|broken -> closing -> idle`.
    pub async fn disconnect(&self) -> ProxyResult<()> {
        *self.state.write().await = ConnState::Closing;
        let transport = self.transport.read().await.clone();
        transport.close().await.map_err(ProxyError::from)?;
        *self.state.write().await = ConnState::Idle;
        Ok(())
    }

    /// Exponential backoff with jitter, capped at 60s, used by the managed
    /// client's reconnect loop.
    pub fn next_backoff(&self) -> std::time::Duration {
        let attempt = self.reconnect_backoff.fetch_add(1, Ordering::SeqCst);
        let base_ms = 500u64.saturating_mul(1u64 << attempt.min(7));
        let capped = base_ms.min(60_000);
        let jitter = (capped / 4).max(1);
        let jittered = capped.saturating_add(fastrand_jitter(jitter));
        std::time::Duration::from_millis(jittered)
    }

    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

/// Small deterministic-ish jitter without pulling in a full RNG dependency
/// for something this low-stakes; `std::time::Instant`'s subsecond nanos
/// are unpredictable enough for spreading reconnect storms apart.
fn fastrand_jitter(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    u64::from(nanos) % max
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpproxy_transport::{HttpTransport, HttpTransportConfig, TransportKind};

    fn factory_for(endpoint: String) -> TransportBuilder {
        Arc::new(move |token: Option<&str>| {
            let mut config = HttpTransportConfig::new(TransportKind::Http, endpoint.clone());
            if let Some(t) = token {
                config.headers.insert("Authorization".to_string(), format!("Bearer {t}"));
            }
            Arc::new(HttpTransport::new(config).expect("http transport")) as Arc<dyn Transport>
        })
    }

    #[tokio::test]
    async fn starts_idle() {
        let conn = CoreConnection::new(
            "acme",
            "https://acme.example.com/mcp",
            factory_for("https://acme.example.com/mcp".to_string()),
            TimeoutConfig::default(),
            None,
        );
        assert_eq!(conn.state().await, ConnState::Idle);
    }

    #[test]
    fn exit_class_maps_to_outcome() {
        let signal = ProcessExitSignal { code: Some(2), port_conflict_detected: false };
        assert_eq!(CoreConnection::classify_exit(signal), ExitOutcome::PortConflict);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let conn = CoreConnection::new(
            "acme",
            "https://acme.example.com/mcp",
            factory_for("https://acme.example.com/mcp".to_string()),
            TimeoutConfig::default(),
            None,
        );
        let first = conn.next_backoff();
        let mut last = first;
        for _ in 0..20 {
            last = conn.next_backoff();
        }
        assert!(last.as_millis() <= 75_000);
        assert!(first.as_millis() >= 500);
    }
}
