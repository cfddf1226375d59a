//! Proxy-specific error wrapping, on top of the workspace-wide
//! [`mcpproxy_protocol::Error`].
//!
//! `ProxyError` converts transport and auth errors automatically and adds
//! `sanitize()`/`is_retryable()` plus a `ProxyErrorExt` context trait.
//! `IntentMismatch` and `PolicyDeny` are never downgraded: every conversion
//! here preserves the original `ErrorKind` untouched.

use thiserror::Error;

use mcpproxy_auth::AuthError;
use mcpproxy_protocol::{Error as McpError, ErrorKind};
use mcpproxy_transport::TransportError;

pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("{0}")]
    Protocol(Box<McpError>),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("server is quarantined: {0}")]
    Quarantined(String),

    #[error("server is disabled: {0}")]
    Disabled(String),

    #[error("intent mismatch: declared {declared}, dispatched via {dispatched}")]
    IntentMismatch { declared: String, dispatched: String },

    #[error("annotation conflict: tool {tool} advertises {annotation}, intent declared {declared}")]
    AnnotationConflict { tool: String, annotation: String, declared: String },

    #[error("policy denied: {0}")]
    PolicyDeny(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Client-safe message, stripped of internal detail. The structured
    /// error shape keeps `guidance`/`recovery_command` separate from what's
    /// safe to hand back verbatim.
    #[must_use]
    pub fn sanitize(&self) -> String {
        match self {
            Self::Protocol(e) if e.is_verbatim() => e.message.clone(),
            Self::Protocol(_) => "protocol error occurred".to_string(),
            Self::Transport(_) => "upstream transport error".to_string(),
            Self::Auth(_) => "authentication error".to_string(),
            Self::ServerNotFound(_) => "server not found".to_string(),
            Self::ToolNotFound(_) => "tool not found".to_string(),
            Self::Quarantined(name) => format!("server '{name}' is quarantined"),
            Self::Disabled(name) => format!("server '{name}' is disabled"),
            Self::IntentMismatch { .. } => self.to_string(),
            Self::AnnotationConflict { .. } => self.to_string(),
            Self::PolicyDeny(_) => self.to_string(),
            Self::Timeout(_) => "operation timed out".to_string(),
            Self::Cancelled => "operation cancelled".to_string(),
            Self::Conflict(_) => "conflicting operation".to_string(),
            Self::Storage(_) => "storage error".to_string(),
            Self::Internal(_) => "internal error".to_string(),
        }
    }

    /// Kinds safe to retry without caller intervention.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_) | Self::Storage(_))
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(e) => e.kind,
            Self::Transport(_) => ErrorKind::TransportUnavailable,
            Self::Auth(e) => McpError::from(e.clone()).kind,
            Self::ServerNotFound(_) | Self::ToolNotFound(_) => ErrorKind::NotFound,
            Self::Quarantined(_) => ErrorKind::Quarantined,
            Self::Disabled(_) => ErrorKind::Disabled,
            Self::IntentMismatch { .. } => ErrorKind::IntentMismatch,
            Self::AnnotationConflict { .. } => ErrorKind::AnnotationConflict,
            Self::PolicyDeny(_) => ErrorKind::PolicyDeny,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Storage(_) => ErrorKind::StorageError,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// A recovery command a machine caller can run, when one applies
    /// (`recovery_command = auth login --server=<name>`).
    #[must_use]
    pub fn recovery_command(&self, server_name: &str) -> Option<String> {
        match self {
            Self::Auth(_) => Some(format!("auth login --server={server_name}")),
            Self::Quarantined(_) => Some(format!("servers approve --server={server_name}")),
            Self::Disabled(_) => Some(format!("servers enable --server={server_name}")),
            _ => None,
        }
    }
}

impl From<ProxyError> for Box<McpError> {
    fn from(err: ProxyError) -> Self {
        match err {
            // Verbatim kinds pass straight through without their message
            // being replaced.
            ProxyError::Protocol(e) => e,
            other => {
                let kind = other.kind();
                Box::new(McpError::new(kind, other.to_string()).with_component("proxy"))
            }
        }
    }
}

impl From<McpError> for ProxyError {
    fn from(err: McpError) -> Self {
        ProxyError::Protocol(Box::new(err))
    }
}

impl From<Box<McpError>> for ProxyError {
    fn from(err: Box<McpError>) -> Self {
        ProxyError::Protocol(err)
    }
}

/// Attaches operation context to an arbitrary `Result` as it crosses into
/// proxy code.
pub trait ProxyErrorExt<T> {
    fn storage_context(self, context: impl Into<String>) -> ProxyResult<T>;
    fn internal_context(self, context: impl Into<String>) -> ProxyResult<T>;
}

impl<T, E> ProxyErrorExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn storage_context(self, context: impl Into<String>) -> ProxyResult<T> {
        self.map_err(|e| ProxyError::Storage(format!("{}: {e}", context.into())))
    }

    fn internal_context(self, context: impl Into<String>) -> ProxyResult<T> {
        self.map_err(|e| ProxyError::Internal(format!("{}: {e}", context.into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_mismatch_is_verbatim_through_sanitize() {
        let err = ProxyError::IntentMismatch { declared: "read".into(), dispatched: "write".into() };
        assert_eq!(err.sanitize(), err.to_string());
        assert_eq!(err.kind(), ErrorKind::IntentMismatch);
    }

    #[test]
    fn policy_deny_is_verbatim_through_sanitize() {
        let err = ProxyError::PolicyDeny("flow risk critical".into());
        assert_eq!(err.sanitize(), err.to_string());
    }

    #[test]
    fn quarantined_sanitizes_to_generic_shape_but_keeps_name() {
        let err = ProxyError::Quarantined("acme".into());
        assert!(err.sanitize().contains("acme"));
    }

    #[test]
    fn auth_error_suggests_login_recovery() {
        let err = ProxyError::Auth(AuthError::AuthRequiredManual);
        assert_eq!(err.recovery_command("acme").as_deref(), Some("auth login --server=acme"));
    }

    #[test]
    fn transport_errors_are_retryable() {
        let err = ProxyError::Transport(TransportError::Timeout);
        assert!(err.is_retryable());
        let err = ProxyError::PolicyDeny("no".into());
        assert!(!err.is_retryable());
    }
}
