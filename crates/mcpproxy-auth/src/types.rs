//! Persisted and ephemeral OAuth data model.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A token record persisted by the [`crate::store::TokenStore`], keyed by
/// `{server_name, url_hash}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthTokenRecord {
    pub server_name: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    /// Unix seconds.
    pub expires_at: Option<i64>,
    pub scopes: Vec<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub callback_port: Option<u16>,
    pub redirect_uri: Option<String>,
    /// Set by an explicit logout; while true the proactive refresher must
    /// not touch this record.
    pub user_logged_out: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OAuthTokenRecord {
    /// True once the token has crossed its expiry minus `threshold`.
    #[must_use]
    pub fn needs_refresh(&self, now: SystemTime, threshold: Duration) -> bool {
        let Some(expires_at) = self.expires_at else { return false };
        let now_secs = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        now_secs + threshold.as_secs() as i64 >= expires_at
    }

    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.needs_refresh(now, Duration::ZERO)
    }
}

/// Client credentials and redirect wiring obtained via DCR, persisted
/// independently of the token so a restart can reuse them without
/// re-registering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub callback_port: u16,
}

/// Cross-process completion signal written by a finished browser flow and
/// polled by waiters that didn't win the race to start it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub server_name: String,
    pub succeeded: bool,
    pub occurred_at: i64,
}

/// State machine for one in-flight authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Initiated,
    Authenticating,
    TokenExchange,
    Completed,
    Failed,
}

/// Ephemeral per-server authentication attempt. Exactly one may be active
/// per server at a time; additional callers await its
/// [`tokio::sync::watch`] channel rather than starting their own.
#[derive(Debug, Clone)]
pub struct OAuthFlowContext {
    pub correlation_id: Uuid,
    pub server_name: String,
    pub state: FlowState,
    pub start_time: SystemTime,
}

impl OAuthFlowContext {
    #[must_use]
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            server_name: server_name.into(),
            state: FlowState::Initiated,
            start_time: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn is_stale(&self, now: SystemTime, reclaim_after: Duration) -> bool {
        now.duration_since(self.start_time).unwrap_or(Duration::ZERO) > reclaim_after
    }
}

/// Outcome handed to every coordinator caller once a flow settles.
#[derive(Debug, Clone)]
pub enum FlowOutcome {
    Token(OAuthTokenRecord),
    Failed(String),
}

/// Where a server's OAuth scopes came from, preserved for diagnostics and
/// for the `InvalidScope` error's "discovered and configured scopes"
/// requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeSource {
    UserConfigured,
    ProtectedResourceMetadata,
    AuthorizationServerMetadata,
    /// Every waterfall step fell through; empty scopes are used. An empty
    /// `scopes_supported=[]` is treated the same as an absent or
    /// unreachable document — both fall through here.
    EmptyDefault,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(expires_at: i64) -> OAuthTokenRecord {
        OAuthTokenRecord {
            server_name: "s".into(),
            access_token: "a".into(),
            refresh_token: Some("r".into()),
            token_type: "Bearer".into(),
            expires_at: Some(expires_at),
            scopes: vec![],
            client_id: None,
            client_secret: None,
            callback_port: None,
            redirect_uri: None,
            user_logged_out: false,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn needs_refresh_within_threshold() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let rec = record(1_050);
        assert!(rec.needs_refresh(now, Duration::from_secs(60)));
        assert!(!rec.needs_refresh(now, Duration::from_secs(10)));
    }

    #[test]
    fn no_expiry_never_needs_refresh() {
        let mut rec = record(0);
        rec.expires_at = None;
        assert!(!rec.needs_refresh(SystemTime::now(), Duration::from_secs(60)));
    }
}
