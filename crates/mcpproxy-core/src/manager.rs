//! Upstream Manager: the keyed map of [`ManagedClient`]s and the
//! only place `ServerConfig` mutations happen. Every mutation emits a typed
//! [`ProxyEvent`] on the [`EventBus`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mcpproxy_auth::{OAuthFlowCoordinator, ServerAuthConfig};
use mcpproxy_transport::{
    HttpTransport, HttpTransportConfig, StdioTransport, StdioTransportConfig, TimeoutConfig, Transport,
};
use tokio::sync::RwLock;
use tracing::info;

use crate::config::{Endpoint, ServerConfig};
use crate::connection::{CoreConnection, TransportBuilder};
use crate::error::{ProxyError, ProxyResult};
use crate::events::{EventBus, EventReason, ProxyEvent};
use crate::health::HealthStatus;
use crate::managed_client::ManagedClient;

fn transport_builder_for(config: &ServerConfig) -> TransportBuilder {
    match config.endpoint.clone() {
        Endpoint::Stdio(stdio) => Arc::new(move |_token: Option<&str>| {
            let cfg = StdioTransportConfig {
                command: stdio.command.clone(),
                args: stdio.args.clone(),
                env: stdio.env.clone(),
                cwd: stdio.cwd.clone(),
                ..StdioTransportConfig::default()
            };
            Arc::new(StdioTransport::new(cfg)) as Arc<dyn Transport>
        }),
        Endpoint::Http(http) => {
            let kind = config.transport_kind;
            Arc::new(move |token: Option<&str>| {
                let mut cfg = HttpTransportConfig::new(kind, http.url.clone());
                cfg.headers = http.headers.clone();
                if let Some(t) = token {
                    cfg.headers.insert("Authorization".to_string(), format!("Bearer {t}"));
                }
                // Client construction only fails on TLS backend initialization,
                // which never happens with the default rustls/native-tls
                // feature set this workspace builds with.
                Arc::new(HttpTransport::new(cfg).expect("http transport client")) as Arc<dyn Transport>
            })
        }
    }
}

fn auth_binding_for(
    config: &ServerConfig,
    coordinator: Option<&Arc<OAuthFlowCoordinator>>,
) -> Option<(Arc<OAuthFlowCoordinator>, ServerAuthConfig)> {
    let oauth = config.oauth.as_ref()?;
    let coordinator = coordinator?;
    Some((
        coordinator.clone(),
        ServerAuthConfig {
            server_name: config.name.clone(),
            resource: config.resource_identity(),
            configured_scopes: oauth.scopes.clone(),
            issuer: oauth.issuer.clone(),
            preferred_callback_port: oauth.preferred_redirect_port,
            user_client_id: oauth.client_id.clone(),
        },
    ))
}

/// Keyed map of managed upstream clients. Construction takes
/// the collaborators every client needs (an event bus to publish onto, an
/// optional OAuth coordinator, shared timeouts) so individual `AddServer`
/// calls stay pure data-plumbing.
pub struct UpstreamManager {
    configs: RwLock<HashMap<String, ServerConfig>>,
    clients: RwLock<HashMap<String, Arc<ManagedClient>>>,
    event_bus: Arc<EventBus>,
    oauth_coordinator: Option<Arc<OAuthFlowCoordinator>>,
    timeout: TimeoutConfig,
    poll_interval: Duration,
}

impl UpstreamManager {
    #[must_use]
    pub fn new(
        event_bus: Arc<EventBus>,
        oauth_coordinator: Option<Arc<OAuthFlowCoordinator>>,
        timeout: TimeoutConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            event_bus,
            oauth_coordinator,
            timeout,
            poll_interval,
        }
    }

    #[must_use]
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    fn build_client(&self, config: &ServerConfig) -> Arc<ManagedClient> {
        let oauth = auth_binding_for(config, self.oauth_coordinator.as_ref());
        let connection = Arc::new(CoreConnection::new(
            config.name.clone(),
            config.resource_identity(),
            transport_builder_for(config),
            self.timeout,
            oauth,
        ));
        Arc::new(ManagedClient::new(config.name.clone(), connection, self.poll_interval))
    }

    /// Register a new server and, if it's enabled, start it immediately.
    pub async fn add_server(&self, config: ServerConfig) -> ProxyResult<()> {
        let name = config.name.clone();
        {
            let mut configs = self.configs.write().await;
            if configs.contains_key(&name) {
                return Err(ProxyError::Conflict(format!("server '{name}' already exists")));
            }
            configs.insert(name.clone(), config.clone());
        }

        let client = self.build_client(&config);
        if config.quarantined {
            client.quarantine().await;
        } else if config.enabled {
            client.start().await;
        } else {
            client.stop().await;
        }
        self.clients.write().await.insert(name.clone(), client);

        info!(server_name = %name, "server added");
        self.event_bus.publish(ProxyEvent::for_server(EventReason::ServerAdded, name));
        Ok(())
    }

    /// Remove a server's runtime state entirely. Its persisted OAuth tokens
    /// are untouched — only an explicit logout erases those.
    ///
    /// Idempotent: removing a server that is already gone is a no-op rather
    /// than a `ServerNotFound` error, so a caller retrying a `RemoveServer`
    /// it isn't sure succeeded converges instead of bouncing off an error.
    pub async fn remove_server(&self, name: &str) -> ProxyResult<()> {
        let removed_config = self.configs.write().await.remove(name);
        if removed_config.is_none() {
            return Ok(());
        }
        if let Some(client) = self.clients.write().await.remove(name) {
            client.stop().await;
        }
        self.event_bus.publish(ProxyEvent::for_server(EventReason::ServerRemoved, name));
        Ok(())
    }

    pub async fn enable_server(&self, name: &str) -> ProxyResult<()> {
        let mut configs = self.configs.write().await;
        let config = configs.get_mut(name).ok_or_else(|| ProxyError::ServerNotFound(name.to_string()))?;
        if config.quarantined {
            return Err(ProxyError::Quarantined(name.to_string()));
        }
        config.enabled = true;
        drop(configs);

        let client = self.clients.read().await.get(name).cloned();
        match client {
            Some(client) => client.start().await,
            None => {
                let config = self.configs.read().await.get(name).cloned().expect("checked above");
                let client = self.build_client(&config);
                client.start().await;
                self.clients.write().await.insert(name.to_string(), client);
            }
        }
        self.event_bus.publish(ProxyEvent::for_server(EventReason::ServerEnabled, name));
        Ok(())
    }

    pub async fn disable_server(&self, name: &str) -> ProxyResult<()> {
        let mut configs = self.configs.write().await;
        let config = configs.get_mut(name).ok_or_else(|| ProxyError::ServerNotFound(name.to_string()))?;
        config.enabled = false;
        drop(configs);

        if let Some(client) = self.clients.read().await.get(name).cloned() {
            client.stop().await;
        }
        self.event_bus.publish(ProxyEvent::for_server(EventReason::ServerDisabled, name));
        Ok(())
    }

    /// Tear down and rebuild a server's connection from scratch, e.g. after
    /// a stdio child exits with a transient error.
    pub async fn restart_server(&self, name: &str) -> ProxyResult<()> {
        let config = self.configs.read().await.get(name).cloned().ok_or_else(|| ProxyError::ServerNotFound(name.to_string()))?;
        if let Some(old) = self.clients.write().await.remove(name) {
            old.stop().await;
        }
        let client = self.build_client(&config);
        if config.enabled && !config.quarantined {
            client.start().await;
        }
        self.clients.write().await.insert(name.to_string(), client);
        self.event_bus.publish(ProxyEvent::for_server(EventReason::ServerRestarted, name));
        Ok(())
    }

    pub async fn get_server(&self, name: &str) -> Option<(ServerConfig, HealthStatus)> {
        let config = self.configs.read().await.get(name).cloned()?;
        let health = match self.clients.read().await.get(name) {
            Some(client) => client.health().await,
            None => HealthStatus::disabled(),
        };
        Some((config, health))
    }

    pub async fn list_servers(&self) -> Vec<(ServerConfig, HealthStatus)> {
        let configs = self.configs.read().await;
        let clients = self.clients.read().await;
        let mut out = Vec::with_capacity(configs.len());
        for (name, config) in configs.iter() {
            let health = match clients.get(name) {
                Some(client) => client.health().await,
                None => HealthStatus::disabled(),
            };
            out.push((config.clone(), health));
        }
        out
    }

    /// Resolve a `server.tool` qualified name to the server that currently
    /// advertises it.
    pub async fn find_tool_owner(&self, qualified_name: &str) -> ProxyResult<(String, String)> {
        let (server_name, tool_name) = mcpproxy_protocol::split_qualified_name(qualified_name)
            .ok_or_else(|| ProxyError::ToolNotFound(qualified_name.to_string()))?;
        let clients = self.clients.read().await;
        let client = clients.get(server_name).ok_or_else(|| ProxyError::ServerNotFound(server_name.to_string()))?;
        let has_tool = client.tools().await.iter().any(|t| t.name == tool_name);
        if !has_tool {
            return Err(ProxyError::ToolNotFound(qualified_name.to_string()));
        }
        Ok((server_name.to_string(), tool_name.to_string()))
    }

    pub async fn client(&self, name: &str) -> Option<Arc<ManagedClient>> {
        self.clients.read().await.get(name).cloned()
    }

    pub async fn server_names(&self) -> Vec<String> {
        self.configs.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> UpstreamManager {
        UpstreamManager::new(Arc::new(EventBus::new(16)), None, TimeoutConfig::default(), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn add_server_publishes_server_added_event() {
        let manager = manager();
        let mut rx = manager.event_bus().subscribe();
        manager
            .add_server(ServerConfig::new_http(
                "acme",
                mcpproxy_transport::TransportKind::Http,
                "https://acme.example.com/mcp",
            ))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.reason, EventReason::ServerAdded);
        assert_eq!(event.server.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn adding_duplicate_server_conflicts() {
        let manager = manager();
        let config =
            ServerConfig::new_http("acme", mcpproxy_transport::TransportKind::Http, "https://acme.example.com/mcp");
        manager.add_server(config.clone()).await.unwrap();
        let err = manager.add_server(config).await.unwrap_err();
        assert!(matches!(err, ProxyError::Conflict(_)));
    }

    #[tokio::test]
    async fn removing_unknown_server_is_a_no_op() {
        let manager = manager();
        manager.remove_server("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn repeated_remove_is_idempotent_after_the_first() {
        let manager = manager();
        manager
            .add_server(ServerConfig::new_http(
                "acme",
                mcpproxy_transport::TransportKind::Http,
                "https://acme.example.com/mcp",
            ))
            .await
            .unwrap();
        manager.remove_server("acme").await.unwrap();
        manager.remove_server("acme").await.unwrap();
        assert!(manager.get_server("acme").await.is_none());
    }

    #[tokio::test]
    async fn find_tool_owner_rejects_unqualified_name() {
        let manager = manager();
        let err = manager.find_tool_owner("bare_name").await.unwrap_err();
        assert!(matches!(err, ProxyError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn disable_then_enable_round_trips_health() {
        let manager = manager();
        manager
            .add_server(ServerConfig::new_http(
                "acme",
                mcpproxy_transport::TransportKind::Http,
                "https://acme.example.com/mcp",
            ))
            .await
            .unwrap();
        manager.disable_server("acme").await.unwrap();
        let (_, health) = manager.get_server("acme").await.unwrap();
        assert_eq!(health.action, crate::health::HealthAction::Enable);

        manager.enable_server("acme").await.unwrap();
        let (_, health) = manager.get_server("acme").await.unwrap();
        assert_ne!(health.action, crate::health::HealthAction::Enable);
    }
}
