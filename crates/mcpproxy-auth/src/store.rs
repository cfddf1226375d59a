//! OAuth Token Store: persists token records and client
//! credentials keyed by `{server_name, url_hash}`, plus a cross-process
//! completion-event bucket so waiters in another process observe a finished
//! browser flow.
//!
//! One `sled`-backed implementation for production, one in-memory
//! implementation for tests — both behind the same [`TokenStore`] trait, the
//! same "pluggable store behind a trait" shape the rest of the workspace
//! uses for its storage seams.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::{AuthError, AuthResult};
use crate::types::{ClientCredentials, CompletionEvent, OAuthTokenRecord};

/// First 16 hex characters of the SHA-256 of a URL, used as the storage
/// key format `{server_name}_{url_hash_16}`.
#[must_use]
pub fn url_hash16(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex_prefix(&digest, 8)
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes.iter().take(n).map(|b| format!("{b:02x}")).collect()
}

fn record_key(server_name: &str, url_hash: &str) -> String {
    format!("{server_name}_{url_hash}")
}

/// Persistence seam for OAuth state. All writes are atomic: a
/// reader never observes a partially written record.
#[async_trait]
pub trait TokenStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, server_name: &str, url_hash: &str) -> AuthResult<Option<OAuthTokenRecord>>;
    async fn save(&self, record: OAuthTokenRecord, url_hash: &str) -> AuthResult<()>;
    async fn get_credentials(&self, server_name: &str) -> AuthResult<Option<ClientCredentials>>;
    async fn save_credentials(&self, server_name: &str, credentials: ClientCredentials) -> AuthResult<()>;
    async fn record_completion(&self, event: CompletionEvent) -> AuthResult<()>;
    async fn poll_completion(&self, server_name: &str, since_unix: i64) -> AuthResult<Option<CompletionEvent>>;
    async fn delete(&self, server_name: &str, url_hash: &str) -> AuthResult<()>;
}

/// In-memory implementation used by tests and by any embedder that doesn't
/// need tokens to survive a restart.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: RwLock<HashMap<String, OAuthTokenRecord>>,
    credentials: RwLock<HashMap<String, ClientCredentials>>,
    completions: RwLock<Vec<CompletionEvent>>,
}

impl InMemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get(&self, server_name: &str, url_hash: &str) -> AuthResult<Option<OAuthTokenRecord>> {
        Ok(self.tokens.read().await.get(&record_key(server_name, url_hash)).cloned())
    }

    async fn save(&self, record: OAuthTokenRecord, url_hash: &str) -> AuthResult<()> {
        let key = record_key(&record.server_name, url_hash);
        self.tokens.write().await.insert(key, record);
        Ok(())
    }

    async fn get_credentials(&self, server_name: &str) -> AuthResult<Option<ClientCredentials>> {
        Ok(self.credentials.read().await.get(server_name).cloned())
    }

    async fn save_credentials(&self, server_name: &str, credentials: ClientCredentials) -> AuthResult<()> {
        self.credentials.write().await.insert(server_name.to_string(), credentials);
        Ok(())
    }

    async fn record_completion(&self, event: CompletionEvent) -> AuthResult<()> {
        self.completions.write().await.push(event);
        Ok(())
    }

    async fn poll_completion(&self, server_name: &str, since_unix: i64) -> AuthResult<Option<CompletionEvent>> {
        Ok(self
            .completions
            .read()
            .await
            .iter()
            .rev()
            .find(|e| e.server_name == server_name && e.occurred_at >= since_unix)
            .cloned())
    }

    async fn delete(&self, server_name: &str, url_hash: &str) -> AuthResult<()> {
        self.tokens.write().await.remove(&record_key(server_name, url_hash));
        Ok(())
    }
}

/// `sled`-backed implementation: two logical buckets (`oauth_tokens`,
/// `oauth_completion`), plus a `client_credentials` tree needed to persist
/// DCR output across restarts without re-running registration.
#[derive(Debug, Clone)]
pub struct SledTokenStore {
    tokens: sled::Tree,
    credentials: sled::Tree,
    completions: sled::Tree,
}

impl SledTokenStore {
    pub fn open(db: &sled::Db) -> AuthResult<Self> {
        let tokens = db.open_tree("oauth_tokens").map_err(|e| AuthError::Storage(e.to_string()))?;
        let credentials = db
            .open_tree("client_credentials")
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        let completions = db
            .open_tree("oauth_completion")
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        Ok(Self { tokens, credentials, completions })
    }
}

#[async_trait]
impl TokenStore for SledTokenStore {
    async fn get(&self, server_name: &str, url_hash: &str) -> AuthResult<Option<OAuthTokenRecord>> {
        let key = record_key(server_name, url_hash);
        let tokens = self.tokens.clone();
        tokio::task::spawn_blocking(move || {
            let Some(bytes) = tokens.get(key.as_bytes()).map_err(|e| AuthError::Storage(e.to_string()))? else {
                return Ok(None);
            };
            serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| AuthError::Storage(e.to_string()))
        })
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))?
    }

    async fn save(&self, record: OAuthTokenRecord, url_hash: &str) -> AuthResult<()> {
        let key = record_key(&record.server_name, url_hash);
        let tokens = self.tokens.clone();
        tokio::task::spawn_blocking(move || {
            let bytes = serde_json::to_vec(&record).map_err(|e| AuthError::Storage(e.to_string()))?;
            tokens.insert(key.as_bytes(), bytes).map_err(|e| AuthError::Storage(e.to_string()))?;
            tokens.flush().map_err(|e| AuthError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))?
    }

    async fn get_credentials(&self, server_name: &str) -> AuthResult<Option<ClientCredentials>> {
        let key = server_name.to_string();
        let credentials = self.credentials.clone();
        tokio::task::spawn_blocking(move || {
            let Some(bytes) = credentials.get(key.as_bytes()).map_err(|e| AuthError::Storage(e.to_string()))? else {
                return Ok(None);
            };
            serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| AuthError::Storage(e.to_string()))
        })
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))?
    }

    async fn save_credentials(&self, server_name: &str, credentials: ClientCredentials) -> AuthResult<()> {
        let key = server_name.to_string();
        let tree = self.credentials.clone();
        tokio::task::spawn_blocking(move || {
            let bytes = serde_json::to_vec(&credentials).map_err(|e| AuthError::Storage(e.to_string()))?;
            tree.insert(key.as_bytes(), bytes).map_err(|e| AuthError::Storage(e.to_string()))?;
            tree.flush().map_err(|e| AuthError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))?
    }

    async fn record_completion(&self, event: CompletionEvent) -> AuthResult<()> {
        let key = format!("{}_{}", event.server_name, event.occurred_at);
        let tree = self.completions.clone();
        tokio::task::spawn_blocking(move || {
            let bytes = serde_json::to_vec(&event).map_err(|e| AuthError::Storage(e.to_string()))?;
            tree.insert(key.as_bytes(), bytes).map_err(|e| AuthError::Storage(e.to_string()))?;
            tree.flush().map_err(|e| AuthError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))?
    }

    async fn poll_completion(&self, server_name: &str, since_unix: i64) -> AuthResult<Option<CompletionEvent>> {
        let prefix = format!("{server_name}_");
        let tree = self.completions.clone();
        let since_unix_owned = since_unix;
        tokio::task::spawn_blocking(move || {
            let mut latest: Option<CompletionEvent> = None;
            for item in tree.scan_prefix(prefix.as_bytes()) {
                let (_, bytes) = item.map_err(|e| AuthError::Storage(e.to_string()))?;
                let event: CompletionEvent =
                    serde_json::from_slice(&bytes).map_err(|e| AuthError::Storage(e.to_string()))?;
                let is_newer = latest.as_ref().map_or(true, |l| event.occurred_at > l.occurred_at);
                if event.occurred_at >= since_unix_owned && is_newer {
                    latest = Some(event);
                }
            }
            Ok(latest)
        })
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))?
    }

    async fn delete(&self, server_name: &str, url_hash: &str) -> AuthResult<()> {
        let key = record_key(server_name, url_hash);
        let tree = self.tokens.clone();
        tokio::task::spawn_blocking(move || {
            tree.remove(key.as_bytes()).map_err(|e| AuthError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))?
    }
}

/// Convenience wrapper used by the coordinator: any store, type-erased.
pub type DynTokenStore = Arc<dyn TokenStore>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(server: &str) -> OAuthTokenRecord {
        OAuthTokenRecord {
            server_name: server.to_string(),
            access_token: "access".into(),
            refresh_token: Some("refresh".into()),
            token_type: "Bearer".into(),
            expires_at: Some(9_999_999_999),
            scopes: vec!["mcp:tools".into()],
            client_id: None,
            client_secret: None,
            callback_port: None,
            redirect_uri: None,
            user_logged_out: false,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn hash_is_stable_and_16_hex_chars() {
        let h1 = url_hash16("https://example.com/mcp");
        let h2 = url_hash16("https://example.com/mcp");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
    }

    #[test]
    fn different_urls_hash_differently() {
        assert_ne!(url_hash16("https://a.example.com/mcp"), url_hash16("https://b.example.com/mcp"));
    }

    #[tokio::test]
    async fn in_memory_store_round_trips_a_record() {
        let store = InMemoryTokenStore::new();
        let hash = url_hash16("https://example.com/mcp");
        store.save(sample_record("acme"), &hash).await.unwrap();
        let fetched = store.get("acme", &hash).await.unwrap().expect("record present");
        assert_eq!(fetched.access_token, "access");
    }

    #[tokio::test]
    async fn completion_poll_only_returns_events_after_watermark() {
        let store = InMemoryTokenStore::new();
        store
            .record_completion(CompletionEvent { server_name: "acme".into(), succeeded: true, occurred_at: 100 })
            .await
            .unwrap();
        assert!(store.poll_completion("acme", 200).await.unwrap().is_none());
        assert!(store.poll_completion("acme", 50).await.unwrap().is_some());
    }
}
