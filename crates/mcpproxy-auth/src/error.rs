//! Auth error taxonomy, converting into the workspace-wide [`McpError`].

use thiserror::Error;

use mcpproxy_protocol::{Error as McpError, ErrorKind};

pub type AuthResult<T> = std::result::Result<T, AuthError>;

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum AuthError {
    /// Non-fatal: scope discovery fell through every waterfall step.
    #[error("scope discovery failed: {0}")]
    ScopeDiscoveryFailed(String),

    /// Non-fatal when a user-provided client_id exists; otherwise escalates
    /// to `AuthRequiredManual`.
    #[error("authorization server does not support dynamic client registration")]
    DcrUnsupported,

    #[error("manual client registration required for this server")]
    AuthRequiredManual,

    #[error("resource owner denied the authorization request")]
    UserDenied,

    /// Fatal: surfaced with discovered/configured scopes and metadata URL.
    #[error("invalid scope: configured={configured:?} discovered={discovered:?} metadata_url={metadata_url}")]
    InvalidScope { configured: Vec<String>, discovered: Vec<String>, metadata_url: String },

    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("no refresh token available")]
    NoRefreshToken,

    #[error("user has explicitly logged out; refresher inhibited")]
    LoggedOut,

    #[error("callback server could not bind any port")]
    CallbackBindFailed,

    #[error("timed out waiting for flow completion")]
    WaitTimeout,

    #[error("flow was cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("invalid discovery document: {0}")]
    InvalidDocument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<AuthError> for McpError {
    fn from(err: AuthError) -> Self {
        let (kind, message) = match &err {
            AuthError::ScopeDiscoveryFailed(m) => (ErrorKind::ScopeDiscoveryFailed, m.clone()),
            AuthError::DcrUnsupported => (ErrorKind::DcrUnsupported, err.to_string()),
            AuthError::AuthRequiredManual => (ErrorKind::AuthRequired, err.to_string()),
            AuthError::UserDenied => (ErrorKind::AuthDenied, err.to_string()),
            AuthError::InvalidScope { .. } => (ErrorKind::InvalidScope, err.to_string()),
            AuthError::TokenExchangeFailed(m) | AuthError::RefreshFailed(m) => {
                (ErrorKind::AuthRequired, m.clone())
            }
            AuthError::NoRefreshToken => (ErrorKind::AuthRequired, err.to_string()),
            AuthError::LoggedOut => (ErrorKind::AuthRequired, err.to_string()),
            AuthError::CallbackBindFailed => (ErrorKind::TransportUnavailable, err.to_string()),
            AuthError::WaitTimeout => (ErrorKind::Timeout, err.to_string()),
            AuthError::Cancelled => (ErrorKind::Cancelled, err.to_string()),
            AuthError::Storage(m) => (ErrorKind::StorageError, m.clone()),
            AuthError::Http(m) => (ErrorKind::TransportUnavailable, m.clone()),
            AuthError::InvalidDocument(m) => (ErrorKind::ProtocolError, m.clone()),
            AuthError::Internal(m) => (ErrorKind::Internal, m.clone()),
        };
        McpError::new(kind, message).with_component("auth")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_scope_is_fatal_auth_kind() {
        let err = AuthError::InvalidScope {
            configured: vec!["a".into()],
            discovered: vec![],
            metadata_url: "https://example.com".into(),
        };
        let mapped: McpError = err.into();
        assert_eq!(mapped.kind, ErrorKind::InvalidScope);
    }

    #[test]
    fn scope_discovery_failure_is_warn_only_kind() {
        let mapped: McpError = AuthError::ScopeDiscoveryFailed("timeout".into()).into();
        assert_eq!(mapped.kind, ErrorKind::ScopeDiscoveryFailed);
    }
}
