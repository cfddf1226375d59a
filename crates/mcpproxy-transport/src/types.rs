//! Transport kind/state/capability types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The configured transport kind for a `ServerConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
    StreamableHttp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable-http",
        };
        f.write_str(s)
    }
}

/// Current lifecycle state of one transport instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed { reason: String },
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// What a given transport kind can do; used by callers that need to decide
/// whether e.g. bidirectional notification streaming is available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCapabilities {
    pub supports_notifications: bool,
    pub supports_reconnect: bool,
    pub max_message_size: Option<usize>,
}

/// Reported once a stdio transport's child process has exited, so the core
/// connection state machine can map well-known exit codes to semantic
/// events (2 → PortConflict, 3 → DBLocked, 4 → ConfigError, else
/// GeneralError).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExitSignal {
    pub code: Option<i32>,
    pub port_conflict_detected: bool,
}

impl ProcessExitSignal {
    /// Classify this signal using the well-known exit-code mapping.
    pub fn classify(&self) -> ExitClass {
        if self.port_conflict_detected {
            return ExitClass::PortConflict;
        }
        match self.code {
            Some(2) => ExitClass::PortConflict,
            Some(3) => ExitClass::DbLocked,
            Some(4) => ExitClass::ConfigError,
            _ => ExitClass::GeneralError,
        }
    }
}

/// The semantic bucket a child process exit falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitClass {
    PortConflict,
    DbLocked,
    ConfigError,
    GeneralError,
}

impl Default for TransportCapabilities {
    fn default() -> Self {
        Self {
            supports_notifications: true,
            supports_reconnect: true,
            max_message_size: Some(10 * 1024 * 1024),
        }
    }
}
