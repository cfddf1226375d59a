//! Transport-wide timeout and size-limit configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Request/response size caps. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_request_size: Option<usize>,
    pub max_response_size: Option<usize>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_size: Some(1024 * 1024),
            max_response_size: Some(10 * 1024 * 1024),
        }
    }
}

impl LimitsConfig {
    /// No limits at all — only appropriate when running behind a trusted gateway.
    #[must_use]
    pub const fn unlimited() -> Self {
        Self { max_request_size: None, max_response_size: None }
    }
}

/// Per-operation timeouts. Defaults to 60s for transport requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { connect: Duration::from_secs(30), request: Duration::from_secs(60) }
    }
}
