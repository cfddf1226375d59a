//! Diagnostics Aggregator: buckets derived purely from
//! `HealthStatus.action` across every managed client. No independent
//! detection logic lives here — if a problem isn't already expressed as a
//! health action, this module has nothing to say about it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::health::HealthAction;
use crate::manager::UpstreamManager;

/// One server's contribution to a diagnostics bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsEntry {
    pub server: String,
    pub summary: String,
    pub detail: Option<String>,
}

/// Buckets keyed by the remediation a caller would take, not by failure
/// mode: `restart` → upstream_errors, `login` → oauth_required,
/// `configure` → oauth_issues, `set_secret` → missing_secrets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub upstream_errors: Vec<DiagnosticsEntry>,
    pub oauth_required: Vec<DiagnosticsEntry>,
    pub oauth_issues: Vec<DiagnosticsEntry>,
    pub missing_secrets: Vec<DiagnosticsEntry>,
}

impl DiagnosticsReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.upstream_errors.is_empty()
            && self.oauth_required.is_empty()
            && self.oauth_issues.is_empty()
            && self.missing_secrets.is_empty()
    }
}

/// Walks every managed client's current health and sorts it into the
/// four remediation buckets.
pub async fn aggregate(manager: &Arc<UpstreamManager>) -> DiagnosticsReport {
    let mut report = DiagnosticsReport::default();
    for (config, health) in manager.list_servers().await {
        let entry = DiagnosticsEntry { server: config.name, summary: health.summary, detail: health.detail };
        match health.action {
            HealthAction::Restart => report.upstream_errors.push(entry),
            HealthAction::Login => report.oauth_required.push(entry),
            HealthAction::Configure => report.oauth_issues.push(entry),
            HealthAction::SetSecret => report.missing_secrets.push(entry),
            HealthAction::Enable | HealthAction::Approve | HealthAction::ViewLogs | HealthAction::None => {}
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::events::EventBus;
    use mcpproxy_transport::{TimeoutConfig, TransportKind};
    use std::time::Duration;

    fn manager() -> Arc<UpstreamManager> {
        Arc::new(UpstreamManager::new(Arc::new(EventBus::new(16)), None, TimeoutConfig::default(), Duration::from_secs(300)))
    }

    #[tokio::test]
    async fn no_servers_is_clean() {
        let report = aggregate(&manager()).await;
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn disabled_server_does_not_appear_in_any_bucket() {
        let manager = manager();
        manager
            .add_server({
                let mut cfg = ServerConfig::new_http("acme", TransportKind::Http, "https://acme.example.com/mcp");
                cfg.enabled = false;
                cfg
            })
            .await
            .unwrap();
        let report = aggregate(&manager).await;
        assert!(report.is_clean());
    }
}
