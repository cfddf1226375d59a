//! The two-key intent model: every dispatched call carries
//! a declared [`OperationType`] that must match the dispatch variant the
//! caller actually invoked.

use serde::{Deserialize, Serialize};

/// The declared effect of a tool call. Mirrors the three dispatch variants
/// in [`crate::dispatcher::ToolDispatcher`] one-to-one — there is
/// deliberately no fourth "unknown" variant, since every call must commit
/// to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Read,
    Write,
    Destructive,
}

impl OperationType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Destructive => "destructive",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied justification accompanying every dispatched call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentDeclaration {
    pub operation_type: OperationType,
    pub justification: String,
    pub correlation_id: Option<String>,
}

impl IntentDeclaration {
    #[must_use]
    pub fn new(operation_type: OperationType, justification: impl Into<String>) -> Self {
        Self { operation_type, justification: justification.into(), correlation_id: None }
    }

    #[must_use]
    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_type_display_matches_wire_string() {
        assert_eq!(OperationType::Read.to_string(), "read");
        assert_eq!(OperationType::Destructive.as_str(), "destructive");
    }
}
