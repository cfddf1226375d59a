//! Flow Tracker & Hook Evaluator: content hashing, per-call
//! origin/destination classification, and the policy decision the dispatcher
//! enforces before forwarding a `write`/`destructive` call upstream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

use crate::activity::{ActivityRecord, ActivityType, DynActivityStore};
use crate::config::ServerClassification;
use crate::intent::OperationType;

const SESSION_TTL: Duration = Duration::from_secs(30 * 60);
const CORRELATION_TTL: Duration = Duration::from_secs(5);
const MIN_HASHED_FIELD_LEN: usize = 20;

/// SHA-256 truncated to the first 128 bits, hex-encoded.
#[must_use]
pub fn hash128(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// One hash produced from a call's arguments or result (/// "multi-granularity: whole payload plus any string field ≥20 chars, both
/// raw and normalised").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHash {
    pub hash: String,
    pub field: Option<String>,
    pub normalized: bool,
}

/// Walks a JSON value, producing the whole-payload hashes plus one pair of
/// hashes (raw, normalized) for every string field at least
/// `MIN_HASHED_FIELD_LEN` bytes long.
pub fn content_hashes(value: &Value) -> Vec<ContentHash> {
    let mut hashes = Vec::new();
    let raw = value.to_string();
    hashes.push(ContentHash { hash: hash128(raw.as_bytes()), field: None, normalized: false });
    hashes.push(ContentHash { hash: hash128(normalize(&raw).as_bytes()), field: None, normalized: true });
    collect_string_fields(value, None, &mut hashes);
    hashes
}

fn collect_string_fields(value: &Value, path: Option<String>, out: &mut Vec<ContentHash>) {
    match value {
        Value::String(s) if s.len() >= MIN_HASHED_FIELD_LEN => {
            out.push(ContentHash { hash: hash128(s.as_bytes()), field: path.clone(), normalized: false });
            out.push(ContentHash { hash: hash128(normalize(s).as_bytes()), field: path, normalized: true });
        }
        Value::Object(map) => {
            for (key, v) in map {
                let field = match &path {
                    Some(p) => format!("{p}.{key}"),
                    None => key.clone(),
                };
                collect_string_fields(v, Some(field), out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                let field = match &path {
                    Some(p) => format!("{p}[{i}]"),
                    None => format!("[{i}]"),
                };
                collect_string_fields(v, Some(field), out);
            }
        }
        _ => {}
    }
}

/// Name-based classification with a per-server override.
#[must_use]
pub fn classify_server(server_name: &str, override_: Option<ServerClassification>) -> ServerClassification {
    if let Some(o) = override_ {
        return o;
    }
    let lower = server_name.to_lowercase();
    const INTERNAL_PATTERNS: &[&str] = &["internal", "corp", "local", "intranet", "private"];
    const EXTERNAL_PATTERNS: &[&str] = &["external", "public", "vendor", "third-party", "thirdparty"];
    if INTERNAL_PATTERNS.iter().any(|p| lower.contains(p)) {
        ServerClassification::Internal
    } else if EXTERNAL_PATTERNS.iter().any(|p| lower.contains(p)) {
        ServerClassification::External
    } else {
        ServerClassification::Unknown
    }
}

/// One recorded output hash, bound to where and when it was seen: an
/// "origin" produced by a `read` call's result.
#[derive(Debug, Clone)]
pub struct FlowOrigin {
    pub hash: String,
    pub server: String,
    pub classification: ServerClassification,
    pub timestamp_nanos: i128,
    pub sensitive: bool,
}

/// Risk bucket assigned to one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Ask,
    Deny,
}

impl PolicyDecision {
    /// The more restrictive of two decisions, used to combine the external
    /// hook adapter's vote with the tracker's own ("the proxy
    /// layer still enforces its own policy" even when the adapter fails
    /// open).
    #[must_use]
    pub fn most_restrictive(self, other: Self) -> Self {
        fn rank(d: PolicyDecision) -> u8 {
            match d {
                PolicyDecision::Allow => 0,
                PolicyDecision::Ask => 1,
                PolicyDecision::Deny => 2,
            }
        }
        if rank(self) >= rank(other) {
            self
        } else {
            other
        }
    }
}

/// Result of one hook/flow evaluation.
#[derive(Debug, Clone)]
pub struct HookEvaluation {
    pub decision: PolicyDecision,
    pub risk: RiskLevel,
    pub session_id: String,
    pub correlation_id: String,
    pub reason: Option<String>,
}

/// Per-session accumulated origins, reaped after 30 minutes of inactivity.
#[derive(Debug, Default)]
struct FlowSession {
    origins: Vec<FlowOrigin>,
    last_used_nanos: i128,
}

struct PendingCorrelation {
    session_id: String,
    registered_at_nanos: i128,
}

/// Injected collaborator deciding whether a piece of text looks sensitive
/// (secrets, PII). Out of scope to implement for real; a no-op default is
/// provided for headless/test embedders.
pub trait SensitiveDataDetector: Send + Sync + std::fmt::Debug {
    fn is_sensitive(&self, text: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct NoopSensitiveDataDetector;

impl SensitiveDataDetector for NoopSensitiveDataDetector {
    fn is_sensitive(&self, _text: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAdapterError {
    Unreachable,
}

/// The out-of-process hook daemon the flow tracker consults alongside its
/// own in-process policy. Calling it is best-effort: on
/// `Unreachable` the tracker fails that vote open rather than blocking the
/// call.
#[async_trait]
pub trait HookAdapter: Send + Sync + std::fmt::Debug {
    async fn evaluate(&self, ctx: &FlowContext) -> Result<PolicyDecision, HookAdapterError>;
}

#[derive(Debug, Default)]
pub struct NoopHookAdapter;

#[async_trait]
impl HookAdapter for NoopHookAdapter {
    async fn evaluate(&self, _ctx: &FlowContext) -> Result<PolicyDecision, HookAdapterError> {
        Ok(PolicyDecision::Allow)
    }
}

/// Everything one call's evaluation needs.
#[derive(Debug, Clone)]
pub struct FlowContext {
    pub server: String,
    pub classification: ServerClassification,
    pub operation: OperationType,
    pub arguments: Value,
    pub session_id: String,
    pub correlation_id: Option<String>,
}

/// Owns `FlowSession` state and the pending-correlation table. Per-server
/// striping, if wanted, is left to the embedder's sharding of `FlowTracker`
/// instances; this type holds one session map.
pub struct FlowTracker {
    sessions: RwLock<HashMap<String, FlowSession>>,
    pending_correlations: RwLock<HashMap<String, PendingCorrelation>>,
    detector: Arc<dyn SensitiveDataDetector>,
    hook_adapter: Option<Arc<dyn HookAdapter>>,
    activity: Option<DynActivityStore>,
}

impl FlowTracker {
    #[must_use]
    pub fn new(
        detector: Arc<dyn SensitiveDataDetector>,
        hook_adapter: Option<Arc<dyn HookAdapter>>,
        activity: Option<DynActivityStore>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            pending_correlations: RwLock::new(HashMap::new()),
            detector,
            hook_adapter,
            activity,
        }
    }

    /// The hook side pre-registers a pending correlation keyed by argument
    /// hash; the next MCP call whose arguments hash the same way adopts
    /// this session id permanently.
    pub async fn register_pending_correlation(&self, argument_hash: &str, session_id: impl Into<String>) {
        self.pending_correlations.write().await.insert(
            argument_hash.to_string(),
            PendingCorrelation { session_id: session_id.into(), registered_at_nanos: now_nanos() },
        );
    }

    async fn resolve_session_id(&self, default_session_id: &str, whole_payload_hash: &str) -> String {
        let mut pending = self.pending_correlations.write().await;
        if let Some(correlation) = pending.remove(whole_payload_hash) {
            if now_nanos() - correlation.registered_at_nanos <= CORRELATION_TTL.as_nanos() as i128 {
                return correlation.session_id;
            }
        }
        default_session_id.to_string()
    }

    pub async fn evaluate(&self, ctx: FlowContext) -> HookEvaluation {
        let hashes = content_hashes(&ctx.arguments);
        let whole_raw = hashes.iter().find(|h| h.field.is_none() && !h.normalized);
        let session_id = match whole_raw {
            Some(h) => self.resolve_session_id(&ctx.session_id, &h.hash).await,
            None => ctx.session_id.clone(),
        };
        let correlation_id = ctx.correlation_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let sensitive = values_with_paths(&ctx.arguments)
            .into_iter()
            .any(|s| s.len() >= MIN_HASHED_FIELD_LEN && self.detector.is_sensitive(&s));

        let (internal_decision, risk) = match ctx.operation {
            OperationType::Read => {
                self.record_origins(&session_id, &ctx.server, ctx.classification, &hashes, sensitive).await;
                (PolicyDecision::Allow, if sensitive { RiskLevel::Medium } else { RiskLevel::Low })
            }
            OperationType::Write | OperationType::Destructive => {
                self.evaluate_write(&session_id, ctx.classification, &hashes).await
            }
        };

        let external_decision = match &self.hook_adapter {
            Some(adapter) => match adapter.evaluate(&ctx).await {
                Ok(decision) => decision,
                Err(HookAdapterError::Unreachable) => {
                    debug!(server = %ctx.server, "external hook adapter unreachable, failing open");
                    PolicyDecision::Allow
                }
            },
            None => PolicyDecision::Allow,
        };
        let decision = internal_decision.most_restrictive(external_decision);

        if let Some(store) = &self.activity {
            let record = ActivityRecord::new(ActivityType::HookEvaluation)
                .with_server(ctx.server.clone())
                .with_session(session_id.clone())
                .with_intent_type(ctx.operation.as_str())
                .with_metadata("decision", format!("{decision:?}"))
                .with_metadata("risk", format!("{risk:?}"))
                .with_metadata("correlation_id", correlation_id.clone());
            let _ = store.append(record).await;
        }

        HookEvaluation { decision, risk, session_id, correlation_id, reason: None }
    }

    async fn record_origins(
        &self,
        session_id: &str,
        server: &str,
        classification: ServerClassification,
        hashes: &[ContentHash],
        sensitive: bool,
    ) {
        let mut sessions = self.sessions.write().await;
        reap_stale_sessions(&mut sessions);
        let session = sessions.entry(session_id.to_string()).or_default();
        session.last_used_nanos = now_nanos();
        for h in hashes {
            session.origins.push(FlowOrigin {
                hash: h.hash.clone(),
                server: server.to_string(),
                classification,
                timestamp_nanos: session.last_used_nanos,
                sensitive,
            });
        }
    }

    /// Spec §4.H: a write/destructive call whose input hashes match a
    /// previously recorded `internal` origin, while the write's own
    /// destination is `external`, escalates risk to `critical`.
    async fn evaluate_write(
        &self,
        session_id: &str,
        destination: ServerClassification,
        hashes: &[ContentHash],
    ) -> (PolicyDecision, RiskLevel) {
        let mut sessions = self.sessions.write().await;
        reap_stale_sessions(&mut sessions);
        let Some(session) = sessions.get_mut(session_id) else {
            return (PolicyDecision::Allow, RiskLevel::Low);
        };
        session.last_used_nanos = now_nanos();

        let mut risk = RiskLevel::Low;
        for h in hashes {
            for origin in &session.origins {
                if origin.hash != h.hash {
                    continue;
                }
                if origin.classification == ServerClassification::Internal
                    && destination == ServerClassification::External
                {
                    risk = RiskLevel::Critical;
                } else if origin.sensitive {
                    risk = risk.max(RiskLevel::High);
                } else {
                    risk = risk.max(RiskLevel::Medium);
                }
            }
        }

        let decision = match risk {
            RiskLevel::Critical => PolicyDecision::Deny,
            RiskLevel::High => PolicyDecision::Ask,
            RiskLevel::Medium | RiskLevel::Low => PolicyDecision::Allow,
        };
        (decision, risk)
    }
}

fn reap_stale_sessions(sessions: &mut HashMap<String, FlowSession>) {
    let cutoff = now_nanos() - SESSION_TTL.as_nanos() as i128;
    sessions.retain(|_, s| s.last_used_nanos >= cutoff);
}

fn values_with_paths(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_strings(value, &mut out);
    out
}

fn collect_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

fn now_nanos() -> i128 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as i128).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracker() -> FlowTracker {
        FlowTracker::new(Arc::new(NoopSensitiveDataDetector), None, None)
    }

    fn ctx(server: &str, classification: ServerClassification, op: OperationType, args: Value) -> FlowContext {
        FlowContext {
            server: server.to_string(),
            classification,
            operation: op,
            arguments: args,
            session_id: "session-1".to_string(),
            correlation_id: None,
        }
    }

    #[test]
    fn classify_server_honors_override() {
        assert_eq!(
            classify_server("random-name", Some(ServerClassification::External)),
            ServerClassification::External
        );
        assert_eq!(classify_server("internal-crm", None), ServerClassification::Internal);
        assert_eq!(classify_server("vendor-api", None), ServerClassification::External);
        assert_eq!(classify_server("widgets", None), ServerClassification::Unknown);
    }

    #[tokio::test]
    async fn read_call_allows_and_records_origin() {
        let tracker = tracker();
        let result = tracker
            .evaluate(ctx(
                "internal-db",
                ServerClassification::Internal,
                OperationType::Read,
                json!({"secret_value_that_is_long_enough": "abcdefghijklmnopqrstuvwxyz"}),
            ))
            .await;
        assert_eq!(result.decision, PolicyDecision::Allow);
        assert_eq!(result.risk, RiskLevel::Low);
    }

    #[tokio::test]
    async fn write_matching_internal_origin_to_external_destination_is_denied() {
        let tracker = tracker();
        let payload = json!({"field_with_enough_characters_here": "abcdefghijklmnopqrstuvwxyz"});

        let read = tracker
            .evaluate(ctx("internal-db", ServerClassification::Internal, OperationType::Read, payload.clone()))
            .await;
        assert_eq!(read.decision, PolicyDecision::Allow);

        let write = tracker
            .evaluate(ctx("vendor-api", ServerClassification::External, OperationType::Write, payload))
            .await;
        assert_eq!(write.risk, RiskLevel::Critical);
        assert_eq!(write.decision, PolicyDecision::Deny);
    }

    #[tokio::test]
    async fn write_with_no_matching_origin_is_allowed() {
        let tracker = tracker();
        let write = tracker
            .evaluate(ctx(
                "vendor-api",
                ServerClassification::External,
                OperationType::Write,
                json!({"unrelated_long_enough_field_value": "zzzzzzzzzzzzzzzzzzzzzzzzzzzz"}),
            ))
            .await;
        assert_eq!(write.decision, PolicyDecision::Allow);
        assert_eq!(write.risk, RiskLevel::Low);
    }

    #[tokio::test]
    async fn unreachable_external_hook_fails_open() {
        #[derive(Debug, Default)]
        struct AlwaysUnreachable;
        #[async_trait]
        impl HookAdapter for AlwaysUnreachable {
            async fn evaluate(&self, _ctx: &FlowContext) -> Result<PolicyDecision, HookAdapterError> {
                Err(HookAdapterError::Unreachable)
            }
        }
        let tracker = FlowTracker::new(Arc::new(NoopSensitiveDataDetector), Some(Arc::new(AlwaysUnreachable)), None);
        let result = tracker
            .evaluate(ctx(
                "acme",
                ServerClassification::Unknown,
                OperationType::Read,
                json!({"field_long_enough_to_be_hashed_here": "value"}),
            ))
            .await;
        assert_eq!(result.decision, PolicyDecision::Allow);
    }

    #[tokio::test]
    async fn pending_correlation_is_adopted_by_the_next_matching_call() {
        let tracker = tracker();
        let payload = json!({"correlated_field_with_enough_length": "value-value-value"});
        let hashes = content_hashes(&payload);
        let whole_raw = hashes.iter().find(|h| h.field.is_none() && !h.normalized).unwrap();
        tracker.register_pending_correlation(&whole_raw.hash, "hook-session-42").await;

        let mut c = ctx("acme", ServerClassification::Unknown, OperationType::Read, payload);
        c.session_id = "original-session".to_string();
        let result = tracker.evaluate(c).await;
        assert_eq!(result.session_id, "hook-session-42");
    }
}
