//! Tool Dispatcher: the only path external callers have into
//! upstream servers. Three intent-carrying variants plus a read-only
//! tool-listing query — deliberately no legacy single-entry `call_tool`.

use std::sync::Arc;

use mcpproxy_protocol::ToolDescriptor;
use serde_json::Value;
use tracing::warn;

use crate::activity::{ActivityRecord, ActivityType, DynActivityStore};
use crate::connection::ConnState;
use crate::error::{ProxyError, ProxyResult};
use crate::flow::{classify_server, content_hashes, FlowContext, FlowTracker, PolicyDecision};
use crate::intent::{IntentDeclaration, OperationType};
use crate::manager::UpstreamManager;

/// Built from the matched tool's advertised annotations; `None` means the
/// server didn't declare the hint, so there is nothing to conflict with.
fn annotation_conflicts(tool: &ToolDescriptor, variant: OperationType) -> Option<&'static str> {
    let read_only = tool.annotations.read_only_hint;
    let destructive = tool.annotations.destructive_hint;
    match variant {
        OperationType::Read if destructive == Some(true) => Some("destructiveHint"),
        OperationType::Write | OperationType::Destructive if read_only == Some(true) => Some("readOnlyHint"),
        _ => None,
    }
}

/// The only entry point through which a caller reaches upstream tools.
/// No single `call_tool` method exists here — that absence is a deliberate
/// design invariant, not an oversight.
pub struct ToolDispatcher {
    manager: Arc<UpstreamManager>,
    flow_tracker: Arc<FlowTracker>,
    activity: Option<DynActivityStore>,
    strict_annotation_mode: bool,
    headless: bool,
}

impl ToolDispatcher {
    #[must_use]
    pub fn new(
        manager: Arc<UpstreamManager>,
        flow_tracker: Arc<FlowTracker>,
        activity: Option<DynActivityStore>,
        strict_annotation_mode: bool,
        headless: bool,
    ) -> Self {
        Self { manager, flow_tracker, activity, strict_annotation_mode, headless }
    }

    pub async fn call_tool_read(
        &self,
        qualified_name: &str,
        arguments: Value,
        intent: IntentDeclaration,
        session_id: &str,
    ) -> ProxyResult<Value> {
        self.dispatch(OperationType::Read, qualified_name, arguments, intent, session_id).await
    }

    pub async fn call_tool_write(
        &self,
        qualified_name: &str,
        arguments: Value,
        intent: IntentDeclaration,
        session_id: &str,
    ) -> ProxyResult<Value> {
        self.dispatch(OperationType::Write, qualified_name, arguments, intent, session_id).await
    }

    pub async fn call_tool_destructive(
        &self,
        qualified_name: &str,
        arguments: Value,
        intent: IntentDeclaration,
        session_id: &str,
    ) -> ProxyResult<Value> {
        self.dispatch(OperationType::Destructive, qualified_name, arguments, intent, session_id).await
    }

    /// Read-only query over every connected server's currently discovered
    /// tool list; carries no intent since it never reaches an
    /// upstream server.
    pub async fn retrieve_tools(&self, query: Option<&str>, limit: usize) -> ProxyResult<Vec<ToolDescriptor>> {
        let mut out = Vec::new();
        for server_name in self.manager.server_names().await {
            let Some(client) = self.manager.client(&server_name).await else { continue };
            for tool in client.tools().await {
                if let Some(q) = query {
                    let q = q.to_lowercase();
                    let matches = tool.name.to_lowercase().contains(&q)
                        || tool.description.as_deref().unwrap_or_default().to_lowercase().contains(&q);
                    if !matches {
                        continue;
                    }
                }
                out.push(tool);
                if out.len() >= limit {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }

    /// Fail-fast validation pipeline: intent/variant match,
    /// server/tool resolution, enabled/quarantine gate, annotation
    /// compatibility, hook/flow evaluation, then forward and record.
    async fn dispatch(
        &self,
        variant: OperationType,
        qualified_name: &str,
        arguments: Value,
        intent: IntentDeclaration,
        session_id: &str,
    ) -> ProxyResult<Value> {
        // Step 1: two-key intent/variant match.
        if intent.operation_type != variant {
            return Err(ProxyError::IntentMismatch {
                declared: intent.operation_type.to_string(),
                dispatched: variant.to_string(),
            });
        }

        // Step 2: server/tool resolution.
        let (server_name, tool_name) = self.manager.find_tool_owner(qualified_name).await?;

        // Step 3: enabled/quarantine gate.
        let (config, _health) =
            self.manager.get_server(&server_name).await.ok_or_else(|| ProxyError::ServerNotFound(server_name.clone()))?;
        if config.quarantined {
            return Err(ProxyError::Quarantined(server_name));
        }
        if !config.enabled {
            return Err(ProxyError::Disabled(server_name));
        }

        let client = self
            .manager
            .client(&server_name)
            .await
            .ok_or_else(|| ProxyError::ServerNotFound(server_name.clone()))?;

        // `enabled ∧ ¬quarantined ∧ ConnectionState = ready` (spec.md §3
        // invariant): the gates above cover the first two; this covers the
        // third, rather than relying on the transport call below to fail on
        // its own for a connection that was never brought up.
        if client.connection().state().await != ConnState::Ready {
            return Err(ProxyError::Transport(mcpproxy_transport::TransportError::NotAvailable(format!(
                "server '{server_name}' is not ready"
            ))));
        }

        // Step 4: annotation compatibility.
        if let Some(tool) = client.tools().await.into_iter().find(|t| t.name == tool_name) {
            if let Some(annotation) = annotation_conflicts(&tool, variant) {
                if self.strict_annotation_mode {
                    return Err(ProxyError::AnnotationConflict {
                        tool: qualified_name.to_string(),
                        annotation: annotation.to_string(),
                        declared: intent.operation_type.to_string(),
                    });
                }
                warn!(tool = %qualified_name, annotation, declared = %intent.operation_type, "annotation mismatch (warn mode)");
            }
        }

        // Step 5: hook/flow evaluation.
        let classification = classify_server(&server_name, config.classification_override);
        let evaluation = self
            .flow_tracker
            .evaluate(FlowContext {
                server: server_name.clone(),
                classification,
                operation: variant,
                arguments: arguments.clone(),
                session_id: session_id.to_string(),
                correlation_id: intent.correlation_id.clone(),
            })
            .await;
        match evaluation.decision {
            PolicyDecision::Deny => {
                return Err(ProxyError::PolicyDeny(
                    evaluation.reason.unwrap_or_else(|| format!("denied for {qualified_name}")),
                ));
            }
            PolicyDecision::Ask if self.headless => {
                // No external approval collaborator is wired up in headless
                // mode, so an `ask` verdict rejects.
                return Err(ProxyError::PolicyDeny(format!(
                    "approval required for {qualified_name} but no approver is available in headless mode"
                )));
            }
            PolicyDecision::Ask => {
                // Deferring to an external approval collaborator is out of
                // scope for this implementation; treat it the same as the
                // headless case rather than silently allowing it through.
                return Err(ProxyError::PolicyDeny(format!("approval required for {qualified_name}")));
            }
            PolicyDecision::Allow => {}
        }

        // Step 6: forward and record.
        let response = client
            .connection()
            .request("tools/call", Some(serde_json::json!({ "name": tool_name, "arguments": arguments })))
            .await?;

        if let Some(store) = &self.activity {
            let hashes = content_hashes(&arguments);
            let record = ActivityRecord::new(ActivityType::ToolCall)
                .with_server(server_name)
                .with_tool(qualified_name)
                .with_session(evaluation.session_id)
                .with_intent_type(variant.as_str())
                .with_metadata("correlation_id", evaluation.correlation_id)
                .with_metadata("content_hashes", hashes.into_iter().map(|h| h.hash).collect::<Vec<_>>());
            let _ = store.append(record).await;
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpproxy_protocol::ToolAnnotations;

    fn tool_with_hints(read_only: Option<bool>, destructive: Option<bool>) -> ToolDescriptor {
        ToolDescriptor {
            name: "delete_record".to_string(),
            description: None,
            input_schema: Value::Null,
            annotations: ToolAnnotations { read_only_hint: read_only, destructive_hint: destructive, ..Default::default() },
        }
    }

    #[test]
    fn read_conflicts_with_destructive_hint() {
        let tool = tool_with_hints(None, Some(true));
        assert_eq!(annotation_conflicts(&tool, OperationType::Read), Some("destructiveHint"));
    }

    #[test]
    fn write_conflicts_with_read_only_hint() {
        let tool = tool_with_hints(Some(true), None);
        assert_eq!(annotation_conflicts(&tool, OperationType::Write), Some("readOnlyHint"));
    }

    #[test]
    fn compatible_annotations_do_not_conflict() {
        let tool = tool_with_hints(Some(false), Some(true));
        assert_eq!(annotation_conflicts(&tool, OperationType::Destructive), None);
    }

    #[test]
    fn missing_annotations_never_conflict() {
        let tool = tool_with_hints(None, None);
        assert_eq!(annotation_conflicts(&tool, OperationType::Write), None);
        assert_eq!(annotation_conflicts(&tool, OperationType::Destructive), None);
    }
}
