//! `mcpproxy`: a minimal binary crate wiring the upstream manager, OAuth
//! coordinator and tool dispatcher into one running proxy core.
//!
//! This crate owns no business logic of its own — it only constructs the
//! collaborators in [`mcpproxy_core`] and [`mcpproxy_auth`] in the right
//! order and hands back a [`ProxyHandle`]. It does not implement a REST/SSE
//! surface, CLI argument parsing, a tray GUI, or config-file loading; an
//! embedder supplies a [`ProxyConfig`] value directly.

mod error;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use mcpproxy_auth::{spawn_refresher, BrowserLauncher, OAuthFlowCoordinator, RecordingLauncher, SledTokenStore};
use mcpproxy_core::{
    aggregate_diagnostics, DiagnosticsReport, DynActivityStore, EventBus, FlowTracker, NoopHookAdapter,
    NoopSensitiveDataDetector, ProxyResult, SledActivityStore, ToolDispatcher, UpstreamManager,
};
use mcpproxy_transport::TimeoutConfig;

pub use error::{FacadeError, FacadeResult};
pub use mcpproxy_core::{HealthStatus, IntentDeclaration, OperationType, ProxyConfig, ProxyError, ServerConfig};

/// The bound-together proxy core: the single object an embedder holds.
///
/// [`Self::manager`] and [`Self::dispatcher`] hand out `Arc` clones freely,
/// but `ProxyHandle` itself owns the refresher background task and the
/// embedded database, so it isn't `Clone` — dropping it tears both down.
pub struct ProxyHandle {
    manager: Arc<UpstreamManager>,
    dispatcher: Arc<ToolDispatcher>,
    oauth_coordinator: Option<Arc<OAuthFlowCoordinator>>,
    refresher: Option<tokio::task::JoinHandle<()>>,
    // Keeps the embedded database alive for the handle's lifetime; sled
    // trees borrowed out of it (token store, activity store) would
    // otherwise outlive their backing file.
    _db: Arc<sled::Db>,
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.refresher.take() {
            handle.abort();
        }
    }
}

impl ProxyHandle {
    /// Boot one proxy instance from an in-process [`ProxyConfig`]. Opens the
    /// embedded KV store at `config.storage_dir`, wires the token store into
    /// an [`OAuthFlowCoordinator`], starts its proactive refresher, then
    /// registers every configured server with the [`UpstreamManager`].
    ///
    /// The browser launcher is always [`RecordingLauncher`] — opening a
    /// platform browser is out of scope here the same way it is in
    /// [`mcpproxy_auth::coordinator`]; a caller that needs a real one
    /// supplies its own [`BrowserLauncher`] via [`Self::start_with_launcher`].
    pub async fn start(config: ProxyConfig) -> FacadeResult<Self> {
        Self::start_with_launcher(config, Arc::new(RecordingLauncher::default())).await
    }

    /// Like [`Self::start`] but with an injected [`BrowserLauncher`], for
    /// embedders that do want to open a real browser window.
    pub async fn start_with_launcher(
        config: ProxyConfig,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> FacadeResult<Self> {
        std::fs::create_dir_all(&config.storage_dir)?;
        let db = Arc::new(sled::open(&config.storage_dir)?);

        let token_store = Arc::new(SledTokenStore::open(&db)?);
        let activity_store: DynActivityStore = Arc::new(SledActivityStore::open(&db)?);

        let coordinator = Arc::new(OAuthFlowCoordinator::new(token_store, launcher));
        let server_auth_configs: Vec<_> = config
            .servers
            .iter()
            .filter(|s| s.oauth.is_some())
            .map(|s| mcpproxy_auth::ServerAuthConfig {
                server_name: s.name.clone(),
                resource: s.resource_identity(),
                configured_scopes: s.oauth.as_ref().expect("filtered above").scopes.clone(),
                issuer: s.oauth.as_ref().expect("filtered above").issuer.clone(),
                preferred_callback_port: s.oauth.as_ref().expect("filtered above").preferred_redirect_port,
                user_client_id: s.oauth.as_ref().expect("filtered above").client_id.clone(),
            })
            .collect();
        let refresher = (!server_auth_configs.is_empty()).then(|| {
            spawn_refresher(coordinator.clone(), server_auth_configs, Default::default(), Duration::from_secs(60))
        });

        let event_bus = Arc::new(EventBus::new(256));
        let manager = Arc::new(UpstreamManager::new(
            event_bus,
            Some(coordinator.clone()),
            TimeoutConfig::default(),
            Duration::from_secs(config.tool_discovery_poll_interval_secs),
        ));

        let flow_tracker = Arc::new(FlowTracker::new(
            Arc::new(NoopSensitiveDataDetector),
            Some(Arc::new(NoopHookAdapter)),
            Some(activity_store.clone()),
        ));
        let dispatcher = Arc::new(ToolDispatcher::new(
            manager.clone(),
            flow_tracker,
            Some(activity_store),
            config.strict_annotation_mode,
            config.headless,
        ));

        for server in &config.servers {
            manager.add_server(server.clone()).await?;
        }

        info!(server_count = config.servers.len(), storage_dir = %config.storage_dir, "proxy core started");
        Ok(Self { manager, dispatcher, oauth_coordinator: Some(coordinator), refresher, _db: db })
    }

    /// The upstream manager, for server lifecycle operations (add/remove/
    /// enable/disable/restart) and the event bus it publishes onto.
    #[must_use]
    pub fn manager(&self) -> &Arc<UpstreamManager> {
        &self.manager
    }

    /// The only path through which callers reach upstream tools.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<ToolDispatcher> {
        &self.dispatcher
    }

    /// Always `Some` — one coordinator is wired up regardless of whether
    /// the initial server list needs OAuth, so servers added later can use
    /// it too.
    #[must_use]
    pub fn oauth_coordinator(&self) -> Option<&Arc<OAuthFlowCoordinator>> {
        self.oauth_coordinator.as_ref()
    }

    /// Snapshot of the remediation-bucketed health report.
    pub async fn diagnostics(&self) -> DiagnosticsReport {
        aggregate_diagnostics(&self.manager).await
    }

    /// Tear down every managed client without dropping the handle itself.
    pub async fn shutdown(&self) -> ProxyResult<()> {
        for name in self.manager.server_names().await {
            self.manager.disable_server(&name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpproxy_transport::TransportKind;
    use tempfile::TempDir;

    fn test_config(storage: &TempDir) -> ProxyConfig {
        ProxyConfig {
            servers: vec![ServerConfig::new_http(
                "acme",
                TransportKind::Http,
                "https://acme.example.com/mcp",
            )],
            storage_dir: storage.path().to_string_lossy().into_owned(),
            ..ProxyConfig::default()
        }
    }

    #[tokio::test]
    async fn start_registers_every_configured_server() {
        let dir = TempDir::new().unwrap();
        let handle = ProxyHandle::start(test_config(&dir)).await.unwrap();
        assert_eq!(handle.manager().server_names().await, vec!["acme".to_string()]);
        assert!(handle.oauth_coordinator().is_some());
    }

    #[tokio::test]
    async fn diagnostics_is_clean_for_a_freshly_disabled_server() {
        let dir = TempDir::new().unwrap();
        let handle = ProxyHandle::start(test_config(&dir)).await.unwrap();
        handle.shutdown().await.unwrap();
        let report = handle.diagnostics().await;
        assert!(report.oauth_required.is_empty());
    }

    #[tokio::test]
    async fn storage_directory_is_created_on_demand() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("nested").join("mcpproxy-data");
        let mut config = test_config(&dir);
        config.storage_dir = nested.to_string_lossy().into_owned();
        let _handle = ProxyHandle::start(config).await.unwrap();
        assert!(nested.is_dir());
    }
}
