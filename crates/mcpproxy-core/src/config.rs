//! `ServerConfig` and the `ProxyConfig` aggregate used to construct an
//! [`crate::manager::UpstreamManager`] programmatically.
//! Loading either from disk is an external collaborator's job.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use mcpproxy_transport::TransportKind;
use serde::{Deserialize, Serialize};

/// OAuth-specific knobs carried on a [`ServerConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthServerConfig {
    pub scopes: Vec<String>,
    pub issuer: Option<String>,
    pub client_id: Option<String>,
    pub resource: Option<String>,
    pub preferred_redirect_port: Option<u16>,
}

/// How a stdio server is launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StdioEndpoint {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
}

/// Where an HTTP-family server lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpEndpoint {
    pub url: String,
    pub headers: HashMap<String, String>,
}

/// The two shapes an upstream endpoint can take, tagged so `ServerConfig`
/// doesn't need separate optional fields for each transport family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind")]
pub enum Endpoint {
    Stdio(StdioEndpoint),
    Http(HttpEndpoint),
}

/// Configured, immutable-between-edits description of one upstream server.
/// Equality/edits are the embedder's concern; this type only carries the
/// data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub transport_kind: TransportKind,
    pub endpoint: Endpoint,
    pub oauth: Option<OAuthServerConfig>,
    pub enabled: bool,
    pub quarantined: bool,
    pub secret_refs: HashMap<String, String>,
    /// Name-based internal/external classification override for the flow
    /// tracker; `None` falls back to the default heuristic.
    pub classification_override: Option<ServerClassification>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ServerConfig {
    #[must_use]
    pub fn new_stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        let now = unix_now();
        Self {
            name: name.into(),
            transport_kind: TransportKind::Stdio,
            endpoint: Endpoint::Stdio(StdioEndpoint {
                command: command.into(),
                args,
                env: HashMap::new(),
                cwd: None,
            }),
            oauth: None,
            enabled: true,
            quarantined: false,
            secret_refs: HashMap::new(),
            classification_override: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn new_http(name: impl Into<String>, kind: TransportKind, url: impl Into<String>) -> Self {
        let now = unix_now();
        Self {
            name: name.into(),
            transport_kind: kind,
            endpoint: Endpoint::Http(HttpEndpoint { url: url.into(), headers: HashMap::new() }),
            oauth: None,
            enabled: true,
            quarantined: false,
            secret_refs: HashMap::new(),
            classification_override: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The MCP endpoint identity used as the RFC 8707 `resource` value and
    /// as the OAuth token-store key.
    #[must_use]
    pub fn resource_identity(&self) -> String {
        match &self.endpoint {
            Endpoint::Http(http) => http.url.clone(),
            Endpoint::Stdio(stdio) => format!("stdio://{}", stdio.command),
        }
    }
}

/// Origin/destination bucket for the flow tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerClassification {
    Internal,
    External,
    Unknown,
}

/// Aggregate needed to construct an [`crate::manager::UpstreamManager`]
/// programmatically: the server list plus process-wide
/// timeouts and the storage directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub servers: Vec<ServerConfig>,
    pub storage_dir: String,
    pub tool_discovery_poll_interval_secs: u64,
    pub activity_retention_days: u32,
    pub activity_retention_max_records: usize,
    pub strict_annotation_mode: bool,
    pub headless: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            storage_dir: "./mcpproxy-data".to_string(),
            tool_discovery_poll_interval_secs: 300,
            activity_retention_days: 7,
            activity_retention_max_records: 10_000,
            strict_annotation_mode: false,
            headless: true,
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_resource_identity_is_stable() {
        let cfg = ServerConfig::new_stdio("everything", "echo-tool", vec!["--stdio".into()]);
        assert_eq!(cfg.resource_identity(), "stdio://echo-tool");
    }

    #[test]
    fn http_resource_identity_is_the_url() {
        let cfg = ServerConfig::new_http("acme", TransportKind::StreamableHttp, "https://acme.example.com/mcp");
        assert_eq!(cfg.resource_identity(), "https://acme.example.com/mcp");
    }
}
