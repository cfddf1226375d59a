//! Transport error taxonomy, with bidirectional conversion into the
//! workspace-wide [`mcpproxy_protocol::Error`].

use thiserror::Error;

use mcpproxy_protocol::{Error as McpError, ErrorKind};

/// A specialized `Result` for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors raised by a [`crate::Transport`] implementation.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("operation timed out")]
    Timeout,

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("transport not available: {0}")]
    NotAvailable(String),

    #[error("io error: {0}")]
    Io(String),

    /// Child process exited with a well-known signal, detected from either
    /// its exit code or a substring on its stderr ring buffer.
    #[error("upstream process signalled a port conflict")]
    PortConflict,

    /// Upstream replied `401` with a `WWW-Authenticate` header carrying a
    /// `resource_metadata` URL; the caller must hand this to the OAuth flow
    /// coordinator before retrying.
    #[error("upstream requires authentication (resource_metadata={resource_metadata_url})")]
    OAuthChallenge { resource_metadata_url: String },

    #[error("request size ({size} bytes) exceeds maximum allowed ({max} bytes)")]
    RequestTooLarge { size: usize, max: usize },

    #[error("response size ({size} bytes) exceeds maximum allowed ({max} bytes)")]
    ResponseTooLarge { size: usize, max: usize },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

impl From<TransportError> for McpError {
    fn from(err: TransportError) -> Self {
        let (kind, message) = match &err {
            TransportError::ConnectionFailed(m) => (ErrorKind::TransportUnavailable, m.clone()),
            TransportError::ConnectionLost(m) => (ErrorKind::TransportUnavailable, m.clone()),
            TransportError::SendFailed(m) | TransportError::ReceiveFailed(m) => {
                (ErrorKind::TransportUnavailable, m.clone())
            }
            TransportError::SerializationFailed(m) => (ErrorKind::ProtocolError, m.clone()),
            TransportError::ProtocolError(m) => (ErrorKind::ProtocolError, m.clone()),
            TransportError::Timeout => (ErrorKind::Timeout, "operation timed out".to_string()),
            TransportError::ConfigurationError(m) => (ErrorKind::Internal, m.clone()),
            TransportError::NotAvailable(m) => (ErrorKind::TransportUnavailable, m.clone()),
            TransportError::Io(m) => (ErrorKind::TransportUnavailable, m.clone()),
            TransportError::PortConflict => {
                (ErrorKind::Conflict, "port conflict".to_string())
            }
            TransportError::OAuthChallenge { resource_metadata_url } => (
                ErrorKind::AuthRequired,
                format!("authentication required, resource_metadata={resource_metadata_url}"),
            ),
            TransportError::RequestTooLarge { size, max } => (
                ErrorKind::Internal,
                format!("request size {size} exceeds max {max}"),
            ),
            TransportError::ResponseTooLarge { size, max } => (
                ErrorKind::Internal,
                format!("response size {size} exceeds max {max}"),
            ),
            TransportError::Internal(m) => (ErrorKind::Internal, m.clone()),
        };
        McpError::new(kind, message).with_component("transport")
    }
}

impl From<McpError> for TransportError {
    fn from(err: McpError) -> Self {
        match err.kind {
            ErrorKind::Timeout => TransportError::Timeout,
            ErrorKind::TransportUnavailable => TransportError::ConnectionFailed(err.message),
            ErrorKind::ProtocolError => TransportError::ProtocolError(err.message),
            ErrorKind::AuthRequired => {
                TransportError::OAuthChallenge { resource_metadata_url: err.message }
            }
            _ => TransportError::Internal(err.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_challenge_maps_to_auth_required() {
        let err = TransportError::OAuthChallenge {
            resource_metadata_url: "https://example.com/.well-known/resource".to_string(),
        };
        let mapped: McpError = err.into();
        assert_eq!(mapped.kind, ErrorKind::AuthRequired);
    }

    #[test]
    fn port_conflict_maps_to_conflict() {
        let mapped: McpError = TransportError::PortConflict.into();
        assert_eq!(mapped.kind, ErrorKind::Conflict);
    }
}
