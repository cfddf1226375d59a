//! Transport-level message envelope.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A message in flight over a transport: either a JSON-RPC request/response
/// or an inbound notification, carried as raw bytes so the transport layer
/// never needs to understand MCP semantics.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub payload: Bytes,
    pub metadata: TransportMessageMetadata,
}

impl TransportMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self { payload: payload.into(), metadata: TransportMessageMetadata::default() }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Metadata riding alongside a [`TransportMessage`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportMessageMetadata {
    pub correlation_id: Option<String>,
    pub headers: HashMap<String, String>,
}
