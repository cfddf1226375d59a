//! The object-safe transport trait each kind implements once.

use std::future::Future;
use std::pin::Pin;

use crate::config::TimeoutConfig;
use crate::error::TransportResult;
use crate::message::TransportMessage;
use crate::types::{TransportCapabilities, TransportKind, TransportState};

/// Uniform send/receive/notify surface over one upstream connection
///. Every method returns a boxed future rather than being an
/// `async fn` so the trait stays object-safe — callers hold a
/// `Box<dyn Transport>` and never need to know which kind backs it.
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Which kind this instance implements.
    fn transport_kind(&self) -> TransportKind;

    /// What this instance can do.
    fn capabilities(&self) -> &TransportCapabilities;

    /// Current lifecycle state.
    fn state(&self) -> Pin<Box<dyn Future<Output = TransportState> + Send + '_>>;

    /// Open the connection. Fails with `TransportError::NotAvailable` (or a
    /// more specific variant) if the endpoint cannot be reached.
    fn open(&self) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>>;

    /// Issue a JSON-RPC request and await its matched response.
    fn request(
        &self,
        method: String,
        params: Option<serde_json::Value>,
        timeout: TimeoutConfig,
    ) -> Pin<Box<dyn Future<Output = TransportResult<serde_json::Value>> + Send + '_>>;

    /// Fire a JSON-RPC notification; no reply is expected.
    fn notify(
        &self,
        method: String,
        params: Option<serde_json::Value>,
    ) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>>;

    /// Pull the next inbound notification, if any is queued. Returns `None`
    /// once the transport has closed and its notification stream is
    /// exhausted — this makes the stream finite.
    fn next_notification(
        &self,
    ) -> Pin<Box<dyn Future<Output = Option<TransportMessage>> + Send + '_>>;

    /// Release every resource held by this transport (sockets, subprocess
    /// groups, pooled connections).
    fn close(&self) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>>;

    /// Best-effort human-readable endpoint description, for logs.
    fn endpoint(&self) -> Option<String> {
        None
    }
}

/// Builds a [`Transport`] instance for a given kind from its configuration.
pub trait TransportFactory: Send + Sync + std::fmt::Debug {
    fn transport_kind(&self) -> TransportKind;
    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _is_object_safe(_t: &dyn Transport) {}
    fn _factory_is_object_safe(_f: &dyn TransportFactory) {}
}
