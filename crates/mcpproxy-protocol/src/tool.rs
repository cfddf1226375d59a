//! Tool descriptors as discovered from an upstream's `tools/list` response.
//! Wire-level only: annotation *interpretation* against a declared intent
//! is the dispatcher's job, not this crate's.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server-advertised hints about a tool's effect on the world: the MCP
/// `tools/list` annotations subset the dispatcher checks against a
/// declared intent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolAnnotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destructive_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotent_hint: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_world_hint: Option<bool>,
}

/// One tool as reported by an upstream server, qualified with the owning
/// server name once it enters this proxy's ordered set of tool descriptors
/// last discovered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    /// Name as the upstream server knows it (unqualified).
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub annotations: ToolAnnotations,
}

impl ToolDescriptor {
    /// `{server_name}.{tool_name}`, the qualified name downstream callers
    /// and `FindToolOwner` use.
    #[must_use]
    pub fn qualified_name(&self, server_name: &str) -> String {
        format!("{server_name}.{}", self.name)
    }
}

/// Split a qualified tool name back into `(server_name, tool_name)`. The
/// server name is everything before the first `.`, since server names
/// themselves never contain one.
#[must_use]
pub fn split_qualified_name(qualified: &str) -> Option<(&str, &str)> {
    qualified.split_once('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualifies_and_splits_round_trip() {
        let tool = ToolDescriptor {
            name: "echo".to_string(),
            description: None,
            input_schema: Value::Null,
            annotations: ToolAnnotations::default(),
        };
        let qualified = tool.qualified_name("everything");
        assert_eq!(qualified, "everything.echo");
        assert_eq!(split_qualified_name(&qualified), Some(("everything", "echo")));
    }

    #[test]
    fn split_rejects_unqualified_name() {
        assert_eq!(split_qualified_name("echo"), None);
    }
}
