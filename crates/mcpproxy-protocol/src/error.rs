//! Unified error type threaded between every layer of the proxy.
//!
//! Mirrors the shape of the upstream protocol crate this workspace is built
//! against: one `Error` struct carrying a classifying `ErrorKind` plus
//! free-form context, rather than one giant enum of leaf variants. Transport,
//! auth, and dispatch errors all convert into this type at their crate
//! boundary and back out again where a caller needs the original shape.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A specialized `Result` alias used across the workspace.
pub type Result<T> = std::result::Result<T, Box<Error>>;

/// The taxonomy from the error handling design: a classification, not an
/// identifier. New kinds may be added without breaking callers that match
/// on a subset (the type is `#[non_exhaustive]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorKind {
    /// Transport could not be opened or has been permanently lost.
    TransportUnavailable,
    /// Malformed or unexpected JSON-RPC traffic.
    ProtocolError,
    /// Initial handshake/capability probe failed.
    HandshakeFailed,
    /// Upstream requires authentication and none is available.
    AuthRequired,
    /// The resource owner denied the authorization request.
    AuthDenied,
    /// Discovered or configured OAuth scope is invalid for this resource.
    InvalidScope,
    /// The authorization server does not support Dynamic Client Registration.
    DcrUnsupported,
    /// Scope discovery failed; callers should proceed with empty scopes.
    ScopeDiscoveryFailed,
    /// The target server is administratively quarantined.
    Quarantined,
    /// The target server is disabled.
    Disabled,
    /// `IntentDeclaration.operation_type` did not match the dispatch variant.
    IntentMismatch,
    /// Server-advertised annotation hints conflict with the declared intent.
    AnnotationConflict,
    /// The hook/flow evaluator denied the call.
    PolicyDeny,
    /// An operation did not complete within its allotted time.
    Timeout,
    /// A caller's cancellation context was triggered.
    Cancelled,
    /// The named entity does not exist.
    NotFound,
    /// The operation conflicts with current state.
    Conflict,
    /// The persistence layer failed.
    StorageError,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TransportUnavailable => "transport_unavailable",
            Self::ProtocolError => "protocol_error",
            Self::HandshakeFailed => "handshake_failed",
            Self::AuthRequired => "auth_required",
            Self::AuthDenied => "auth_denied",
            Self::InvalidScope => "invalid_scope",
            Self::DcrUnsupported => "dcr_unsupported",
            Self::ScopeDiscoveryFailed => "scope_discovery_failed",
            Self::Quarantined => "quarantined",
            Self::Disabled => "disabled",
            Self::IntentMismatch => "intent_mismatch",
            Self::AnnotationConflict => "annotation_conflict",
            Self::PolicyDeny => "policy_deny",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::StorageError => "storage_error",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Structured context attached to an [`Error`], matching the
/// `{code, message, guidance, recovery_command, context}` shape callers can
/// use to auto-recover.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Component that raised the error (`"transport"`, `"auth"`, `"dispatch"`, ...).
    pub component: Option<String>,
    /// Human guidance describing what went wrong and why.
    pub guidance: Option<String>,
    /// A suggested command/action a machine caller could run to recover,
    /// e.g. `"auth login --server=<name>"`.
    pub recovery_command: Option<String>,
    /// Free-form structured context (server name, correlation id, ...).
    pub fields: HashMap<String, serde_json::Value>,
}

/// The unified error type. Carries a stable id for log correlation, a
/// classifying kind, a human message, structured context, and an optional
/// wrapped source for chained failures.
#[derive(Debug, Clone, Serialize)]
pub struct Error {
    pub id: Uuid,
    pub kind: ErrorKind,
    pub message: String,
    pub context: ErrorContext,
    #[serde(skip)]
    pub source: Option<Box<Error>>,
}

impl Error {
    /// Build a new error of the given kind with a message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            context: ErrorContext::default(),
            source: None,
        }
    }

    /// Tag the error with the component that raised it.
    #[must_use]
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.context.component = Some(component.into());
        self
    }

    /// Attach human guidance.
    #[must_use]
    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.context.guidance = Some(guidance.into());
        self
    }

    /// Attach a machine-recoverable command.
    #[must_use]
    pub fn with_recovery_command(mut self, cmd: impl Into<String>) -> Self {
        self.context.recovery_command = Some(cmd.into());
        self
    }

    /// Attach a structured context field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.fields.insert(key.into(), v);
        }
        self
    }

    /// Wrap an underlying error as the cause of this one.
    #[must_use]
    pub fn with_source(mut self, source: Error) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// True for kinds that are safe to retry without caller intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::TransportUnavailable | ErrorKind::Timeout | ErrorKind::StorageError
        )
    }

    /// Kinds that must never be downgraded or replaced by a generic message
    /// as they pass between layers ("policy denials and intent
    /// mismatches are always surfaced verbatim").
    pub fn is_verbatim(&self) -> bool {
        matches!(self.kind, ErrorKind::IntentMismatch | ErrorKind::PolicyDeny)
    }

    /// Box this error as a boxed `Result` error for `?`-propagation.
    pub fn boxed(self) -> Box<Error> {
        Box::new(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl<'de> Deserialize<'de> for Error {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Shadow {
            id: Uuid,
            kind: ErrorKind,
            message: String,
            #[serde(default)]
            context: ErrorContext,
        }
        let shadow = Shadow::deserialize(deserializer)?;
        Ok(Error {
            id: shadow.id,
            kind: shadow.kind,
            message: shadow.message,
            context: shadow.context,
            source: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbatim_kinds_are_flagged() {
        let e = Error::new(ErrorKind::IntentMismatch, "mismatch");
        assert!(e.is_verbatim());
        let e = Error::new(ErrorKind::PolicyDeny, "denied");
        assert!(e.is_verbatim());
        let e = Error::new(ErrorKind::NotFound, "missing");
        assert!(!e.is_verbatim());
    }

    #[test]
    fn retryable_kinds() {
        assert!(Error::new(ErrorKind::Timeout, "t").is_retryable());
        assert!(!Error::new(ErrorKind::AuthDenied, "d").is_retryable());
    }

    #[test]
    fn round_trips_through_json_without_source() {
        let e = Error::new(ErrorKind::StorageError, "disk full").with_component("store");
        let json = serde_json::to_string(&e).unwrap();
        let back: Error = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, ErrorKind::StorageError);
        assert_eq!(back.context.component.as_deref(), Some("store"));
    }

    #[test]
    fn display_includes_kind_and_message() {
        let e = Error::new(ErrorKind::Conflict, "already exists");
        assert_eq!(e.to_string(), "[conflict] already exists");
    }
}
