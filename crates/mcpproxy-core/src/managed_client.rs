//! Managed Client: wraps one [`CoreConnection`] with a reconnect
//! loop, a tool-discovery loop (poll timer + notification-driven), and a
//! unified [`HealthStatus`] view. Exactly one `ManagedClient` exists per
//! enabled [`crate::config::ServerConfig`], owned by the
//! [`crate::manager::UpstreamManager`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mcpproxy_protocol::ToolDescriptor;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::connection::{ConnState, CoreConnection, ExitOutcome};
use crate::health::{AdminState, ConnectionState, HealthStatus, OAuthState};

/// Background loops owned by a [`ManagedClient`], aborted together on
/// disable or drop so neither survives the client that spawned it.
#[derive(Default)]
struct Tasks {
    reconnect: Option<tokio::task::JoinHandle<()>>,
    discovery: Option<tokio::task::JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        if let Some(h) = self.reconnect.take() {
            h.abort();
        }
        if let Some(h) = self.discovery.take() {
            h.abort();
        }
    }
}

/// One upstream server's runtime state: the connection state machine plus
/// the reconnect and discovery loops that supervise it.
pub struct ManagedClient {
    server_name: String,
    connection: Arc<CoreConnection>,
    tasks: Mutex<Tasks>,
    admin_state: RwLock<AdminState>,
    oauth_state: RwLock<OAuthState>,
    /// Guards tool discovery so the 5-minute poll and a
    /// `tools/list_changed` notification never run `discover_tools`
    /// concurrently for the same server.
    discovery_in_progress: AtomicBool,
    poll_interval: Duration,
}

impl ManagedClient {
    #[must_use]
    pub fn new(server_name: impl Into<String>, connection: Arc<CoreConnection>, poll_interval: Duration) -> Self {
        Self {
            server_name: server_name.into(),
            connection,
            tasks: Mutex::new(Tasks::default()),
            admin_state: RwLock::new(AdminState::Enabled),
            oauth_state: RwLock::new(OAuthState::None),
            discovery_in_progress: AtomicBool::new(false),
            poll_interval,
        }
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<CoreConnection> {
        &self.connection
    }

    pub async fn set_oauth_state(&self, state: OAuthState) {
        *self.oauth_state.write().await = state;
    }

    /// Start the reconnect loop and the tool-discovery loop. Idempotent:
    /// calling it while already started is a no-op, matching
    /// `enable_server` being safely re-callable.
    pub async fn start(self: &Arc<Self>) {
        *self.admin_state.write().await = AdminState::Enabled;
        let mut tasks = self.tasks.lock().await;
        if tasks.reconnect.is_none() {
            tasks.reconnect = Some(self.clone().spawn_reconnect_loop());
        }
        if tasks.discovery.is_none() {
            tasks.discovery = Some(self.clone().spawn_discovery_loop());
        }
    }

    /// Stop both background loops and release the transport (/// "disable stops reconnects and releases the transport").
    pub async fn stop(&self) {
        *self.admin_state.write().await = AdminState::Disabled;
        self.tasks.lock().await.abort_all();
        if let Err(e) = self.connection.disconnect().await {
            warn!(server_name = %self.server_name, error = %e, "error releasing transport on stop");
        }
    }

    pub async fn quarantine(&self) {
        *self.admin_state.write().await = AdminState::Quarantined;
        self.tasks.lock().await.abort_all();
        let _ = self.connection.disconnect().await;
    }

    fn spawn_reconnect_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if *self.admin_state.read().await != AdminState::Enabled {
                    break;
                }
                let state = self.connection.state().await;
                if matches!(state, ConnState::Ready | ConnState::Opening | ConnState::Handshaking) {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                match self.connection.connect().await {
                    Ok(_) => {
                        info!(server_name = %self.server_name, "connected");
                        self.trigger_discovery().await;
                    }
                    Err(e) => {
                        let delay = self.connection.next_backoff();
                        warn!(
                            server_name = %self.server_name,
                            error = %e,
                            delay_ms = delay.as_millis(),
                            "connect attempt failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            debug!(server_name = %self.server_name, "reconnect loop stopped");
        })
    }

    fn spawn_discovery_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.tick().await; // don't fire immediately; connect loop triggers the first discovery
            loop {
                if *self.admin_state.read().await != AdminState::Enabled {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        self.trigger_discovery().await;
                    }
                    changed = self.connection.poll_next_notification() => {
                        match changed {
                            Some(true) => self.trigger_discovery().await,
                            Some(false) => {}
                            None => {
                                // transport closed its notification stream; back off briefly
                                // so this doesn't spin while the reconnect loop recovers.
                                tokio::time::sleep(Duration::from_millis(250)).await;
                            }
                        }
                    }
                }
            }
            debug!(server_name = %self.server_name, "discovery loop stopped");
        })
    }

    /// Run `discover_tools` unless a discovery is already in flight for
    /// this server, tracked per client since each owns exactly one
    /// server name.
    async fn trigger_discovery(&self) {
        if self.discovery_in_progress.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.connection.discover_tools().await {
            warn!(server_name = %self.server_name, error = %e, "tool discovery failed");
        }
        self.discovery_in_progress.store(false, Ordering::SeqCst);
    }

    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.connection.tools().await
    }

    /// Unified health: `action` is the single field the
    /// REST surface and [`crate::diagnostics`] consume.
    pub async fn health(&self) -> HealthStatus {
        let admin_state = *self.admin_state.read().await;
        match admin_state {
            AdminState::Disabled => return HealthStatus::disabled(),
            AdminState::Quarantined => return HealthStatus::quarantined(),
            AdminState::Enabled => {}
        }

        if *self.oauth_state.read().await == OAuthState::Expired {
            return HealthStatus::auth_required(format!("{} token expired", self.server_name));
        }

        match self.connection.state().await {
            ConnState::Ready => HealthStatus::healthy(),
            ConnState::Idle | ConnState::Opening | ConnState::Handshaking => HealthStatus {
                level: crate::health::HealthLevel::Degraded,
                admin_state,
                summary: "connecting".to_string(),
                detail: None,
                action: crate::health::HealthAction::None,
            },
            ConnState::Closing => HealthStatus {
                level: crate::health::HealthLevel::Degraded,
                admin_state,
                summary: "closing".to_string(),
                detail: None,
                action: crate::health::HealthAction::None,
            },
            ConnState::Broken => {
                if *self.oauth_state.read().await == OAuthState::Error {
                    HealthStatus::auth_required(format!("{} authentication failed", self.server_name))
                } else {
                    HealthStatus::needs_restart(format!("{} connection broken", self.server_name))
                }
            }
        }
    }

    /// Translate a stdio child's exit into a connection-level observation,
    /// used by the owning manager to decide whether to surface `restart`
    /// or `configure` in health.
    #[must_use]
    pub fn health_for_exit(outcome: ExitOutcome, detail: impl Into<String>) -> HealthStatus {
        let detail = detail.into();
        match outcome {
            ExitOutcome::ConfigError => HealthStatus::misconfigured(detail),
            ExitOutcome::PortConflict | ExitOutcome::DbLocked | ExitOutcome::GeneralError => {
                HealthStatus::needs_restart(detail)
            }
        }
    }

    #[must_use]
    pub fn connection_state_summary(state: ConnState) -> ConnectionState {
        match state {
            ConnState::Ready => ConnectionState::Ready,
            ConnState::Idle | ConnState::Closing => ConnectionState::Disconnected,
            ConnState::Opening | ConnState::Handshaking => ConnectionState::Connecting,
            ConnState::Broken => ConnectionState::Error,
        }
    }
}

impl Drop for ManagedClient {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            tasks.abort_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpproxy_transport::{HttpTransport, HttpTransportConfig, TimeoutConfig, Transport, TransportKind};

    fn factory_for(endpoint: String) -> crate::connection::TransportBuilder {
        Arc::new(move |_token: Option<&str>| {
            let config = HttpTransportConfig::new(TransportKind::Http, endpoint.clone());
            Arc::new(HttpTransport::new(config).expect("http transport")) as Arc<dyn Transport>
        })
    }

    fn client_for(endpoint: &str) -> Arc<ManagedClient> {
        let conn = Arc::new(CoreConnection::new(
            "acme",
            endpoint,
            factory_for(endpoint.to_string()),
            TimeoutConfig::default(),
            None,
        ));
        Arc::new(ManagedClient::new("acme", conn, Duration::from_secs(300)))
    }

    #[tokio::test]
    async fn fresh_client_reports_degraded_connecting_health() {
        let client = client_for("https://acme.example.com/mcp");
        let health = client.health().await;
        assert_eq!(health.action.as_str(), "");
    }

    #[tokio::test]
    async fn disabled_client_reports_enable_action() {
        let client = client_for("https://acme.example.com/mcp");
        client.stop().await;
        let health = client.health().await;
        assert_eq!(health.action, crate::health::HealthAction::Enable);
    }

    #[tokio::test]
    async fn quarantined_client_reports_approve_action() {
        let client = client_for("https://acme.example.com/mcp");
        client.quarantine().await;
        let health = client.health().await;
        assert_eq!(health.action, crate::health::HealthAction::Approve);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_aborts_loops() {
        let client = client_for("https://acme.example.com/mcp");
        client.start().await;
        client.start().await;
        client.stop().await;
        assert!(client.tasks.lock().await.reconnect.is_none());
    }

    #[test]
    fn exit_outcomes_map_to_sensible_health_actions() {
        assert_eq!(
            ManagedClient::health_for_exit(ExitOutcome::ConfigError, "bad config").action,
            crate::health::HealthAction::Configure
        );
        assert_eq!(
            ManagedClient::health_for_exit(ExitOutcome::PortConflict, "port in use").action,
            crate::health::HealthAction::Restart
        );
    }
}
