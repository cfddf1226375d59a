//! Append-only activity log: `tool_call`, `hook_evaluation`,
//! `flow_summary` and `oauth_event`/`auditor_finding` records, pruned by
//! retention. Keyed `{timestamp_nanos}_{uuid}`, persisted through the same
//! pluggable-store shape as [`mcpproxy_auth::TokenStore`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ProxyError, ProxyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    ToolCall,
    HookEvaluation,
    FlowSummary,
    OauthEvent,
    AuditorFinding,
}

/// One append-only activity entry. `metadata` is a typed bag kept
/// as opaque JSON since its shape varies by `activity_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub activity_type: ActivityType,
    /// Unix nanoseconds, used as the storage key's sort prefix.
    pub timestamp_nanos: i128,
    pub server: Option<String>,
    pub tool: Option<String>,
    pub session_id: Option<String>,
    pub intent_type: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ActivityRecord {
    #[must_use]
    pub fn new(activity_type: ActivityType) -> Self {
        Self {
            id: Uuid::new_v4(),
            activity_type,
            timestamp_nanos: unix_now_nanos(),
            server: None,
            tool: None,
            session_id: None,
            intent_type: None,
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    #[must_use]
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_intent_type(mut self, intent_type: impl Into<String>) -> Self {
        self.intent_type = Some(intent_type.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }

    /// `{timestamp_nanos}_{uuid}`, the canonical storage key format.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}_{}", self.timestamp_nanos, self.id)
    }
}

/// Retention policy applied when pruning ("≤7 days or ≤10,000
/// records default").
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub max_age_days: u32,
    pub max_records: usize,
}

/// Persistence seam for the activity log, matching the
/// [`mcpproxy_auth::TokenStore`] "pluggable store behind a trait" shape.
#[async_trait]
pub trait ActivityStore: Send + Sync + std::fmt::Debug {
    async fn append(&self, record: ActivityRecord) -> ProxyResult<()>;
    /// Most-recent-first listing, optionally filtered by type and/or
    /// intent_type.
    async fn list(
        &self,
        types: &[ActivityType],
        intent_type: Option<&str>,
        limit: usize,
    ) -> ProxyResult<Vec<ActivityRecord>>;
    async fn prune(&self, policy: RetentionPolicy) -> ProxyResult<usize>;
}

/// In-memory implementation: a bounded deque, used by tests and by any
/// embedder not wiring up `sled`.
#[derive(Debug, Default)]
pub struct InMemoryActivityStore {
    records: RwLock<VecDeque<ActivityRecord>>,
}

impl InMemoryActivityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActivityStore for InMemoryActivityStore {
    async fn append(&self, record: ActivityRecord) -> ProxyResult<()> {
        self.records.write().await.push_back(record);
        Ok(())
    }

    async fn list(
        &self,
        types: &[ActivityType],
        intent_type: Option<&str>,
        limit: usize,
    ) -> ProxyResult<Vec<ActivityRecord>> {
        let guard = self.records.read().await;
        Ok(guard
            .iter()
            .rev()
            .filter(|r| types.is_empty() || types.contains(&r.activity_type))
            .filter(|r| match intent_type {
                Some(want) => r.intent_type.as_deref() == Some(want),
                None => true,
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn prune(&self, policy: RetentionPolicy) -> ProxyResult<usize> {
        let cutoff = unix_now_nanos() - i128::from(policy.max_age_days) * 86_400_000_000_000;
        let mut guard = self.records.write().await;
        let before = guard.len();
        guard.retain(|r| r.timestamp_nanos >= cutoff);
        while guard.len() > policy.max_records {
            guard.pop_front();
        }
        Ok(before - guard.len())
    }
}

/// `sled`-backed implementation using the `activity` bucket.
#[derive(Debug, Clone)]
pub struct SledActivityStore {
    tree: sled::Tree,
}

impl SledActivityStore {
    pub fn open(db: &sled::Db) -> ProxyResult<Self> {
        let tree = db.open_tree("activity").map_err(|e| ProxyError::Storage(e.to_string()))?;
        Ok(Self { tree })
    }
}

#[async_trait]
impl ActivityStore for SledActivityStore {
    async fn append(&self, record: ActivityRecord) -> ProxyResult<()> {
        let key = record.storage_key();
        let tree = self.tree.clone();
        tokio::task::spawn_blocking(move || {
            let bytes = serde_json::to_vec(&record).map_err(|e| ProxyError::Storage(e.to_string()))?;
            tree.insert(key.as_bytes(), bytes).map_err(|e| ProxyError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| ProxyError::Internal(e.to_string()))?
    }

    async fn list(
        &self,
        types: &[ActivityType],
        intent_type: Option<&str>,
        limit: usize,
    ) -> ProxyResult<Vec<ActivityRecord>> {
        let tree = self.tree.clone();
        let types = types.to_vec();
        let intent_type = intent_type.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for item in tree.iter().rev() {
                let (_, bytes) = item.map_err(|e| ProxyError::Storage(e.to_string()))?;
                let record: ActivityRecord =
                    serde_json::from_slice(&bytes).map_err(|e| ProxyError::Storage(e.to_string()))?;
                if !types.is_empty() && !types.contains(&record.activity_type) {
                    continue;
                }
                if let Some(want) = &intent_type {
                    if record.intent_type.as_deref() != Some(want.as_str()) {
                        continue;
                    }
                }
                out.push(record);
                if out.len() >= limit {
                    break;
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| ProxyError::Internal(e.to_string()))?
    }

    async fn prune(&self, policy: RetentionPolicy) -> ProxyResult<usize> {
        let cutoff = unix_now_nanos() - i128::from(policy.max_age_days) * 86_400_000_000_000;
        let tree = self.tree.clone();
        let max_records = policy.max_records;
        tokio::task::spawn_blocking(move || {
            let mut keys: Vec<_> = tree.iter().keys().filter_map(std::result::Result::ok).collect();
            let mut removed = 0usize;
            for key in &keys {
                if let Some(stamp) = std::str::from_utf8(key).ok().and_then(|s| s.split('_').next()) {
                    if stamp.parse::<i128>().map(|t| t < cutoff).unwrap_or(false) {
                        let _ = tree.remove(key);
                        removed += 1;
                    }
                }
            }
            keys.retain(|k| tree.contains_key(k).unwrap_or(false));
            while keys.len() > max_records {
                if let Some(oldest) = keys.first().cloned() {
                    let _ = tree.remove(&oldest);
                    keys.remove(0);
                    removed += 1;
                } else {
                    break;
                }
            }
            Ok::<usize, ProxyError>(removed)
        })
        .await
        .map_err(|e| ProxyError::Internal(e.to_string()))?
    }
}

pub type DynActivityStore = Arc<dyn ActivityStore>;

fn unix_now_nanos() -> i128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i128)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_filters_by_type_and_intent() {
        let store = InMemoryActivityStore::new();
        store
            .append(ActivityRecord::new(ActivityType::ToolCall).with_intent_type("read"))
            .await
            .unwrap();
        store
            .append(ActivityRecord::new(ActivityType::HookEvaluation).with_intent_type("write"))
            .await
            .unwrap();

        let tool_calls = store.list(&[ActivityType::ToolCall], None, 10).await.unwrap();
        assert_eq!(tool_calls.len(), 1);

        let reads = store.list(&[], Some("read"), 10).await.unwrap();
        assert_eq!(reads.len(), 1);
        assert_eq!(reads[0].activity_type, ActivityType::ToolCall);
    }

    #[tokio::test]
    async fn prune_enforces_max_records() {
        let store = InMemoryActivityStore::new();
        for _ in 0..5 {
            store.append(ActivityRecord::new(ActivityType::ToolCall)).await.unwrap();
        }
        let removed = store.prune(RetentionPolicy { max_age_days: 7, max_records: 2 }).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.list(&[], None, 100).await.unwrap().len(), 2);
    }

    #[test]
    fn storage_key_is_timestamp_then_uuid() {
        let record = ActivityRecord::new(ActivityType::OauthEvent);
        let key = record.storage_key();
        assert!(key.starts_with(&record.timestamp_nanos.to_string()));
        assert!(key.ends_with(&record.id.to_string()));
    }
}
