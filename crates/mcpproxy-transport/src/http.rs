//! HTTP-family transports: plain HTTP, SSE, and streamable-HTTP.
//!
//! All three share a pooled [`reqwest::Client`] and the same `401` ->
//! [`TransportError::OAuthChallenge`] surfacing; they differ only in how a
//! server-initiated notification stream is opened, which [`TransportKind`]
//! governs.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::{trace, warn};
use url::Url;

use crate::config::TimeoutConfig;
use crate::error::{TransportError, TransportResult};
use crate::message::{TransportMessage, TransportMessageMetadata};
use crate::traits::Transport;
use crate::types::{TransportCapabilities, TransportKind, TransportState};

/// Configuration shared by the HTTP/SSE/streamable-HTTP transport variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTransportConfig {
    pub kind: TransportKind,
    pub endpoint: String,
    pub headers: HashMap<String, String>,
    pub session_id_header: String,
}

impl HttpTransportConfig {
    #[must_use]
    pub fn new(kind: TransportKind, endpoint: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            headers: HashMap::new(),
            session_id_header: "Mcp-Session-Id".to_string(),
        }
    }
}

/// Extracts the `resource_metadata` URL from a `401`'s `WWW-Authenticate`
/// header, per RFC 9728 §5.1. Returns `None` if the header is absent or
/// doesn't carry the parameter — the caller falls through to RFC 8414.
fn parse_resource_metadata_challenge(header_value: &str) -> Option<String> {
    header_value.split(',').find_map(|part| {
        let part = part.trim();
        let rest = part.strip_prefix("resource_metadata=")?;
        Some(rest.trim_matches('"').to_string())
    })
}

/// HTTP-family transport. Owns one pooled client and, for SSE/streamable
/// variants, a background task forwarding server-sent events into a
/// bounded channel consumed by [`Transport::next_notification`].
#[derive(Debug)]
pub struct HttpTransport {
    config: HttpTransportConfig,
    client: Client,
    capabilities: TransportCapabilities,
    state: Arc<TokioMutex<TransportState>>,
    session_id: Arc<TokioMutex<Option<String>>>,
    notifications_rx: Arc<TokioMutex<Option<mpsc::Receiver<TransportMessage>>>>,
    sse_task: Arc<TokioMutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> TransportResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| TransportError::ConfigurationError(format!("http client: {e}")))?;
        let supports_notifications = matches!(config.kind, TransportKind::Sse | TransportKind::StreamableHttp);
        Ok(Self {
            config,
            client,
            capabilities: TransportCapabilities {
                supports_notifications,
                supports_reconnect: true,
                max_message_size: Some(10 * 1024 * 1024),
            },
            state: Arc::new(TokioMutex::new(TransportState::Disconnected)),
            session_id: Arc::new(TokioMutex::new(None)),
            notifications_rx: Arc::new(TokioMutex::new(None)),
            sse_task: Arc::new(TokioMutex::new(None)),
        })
    }

    fn headers(&self, session_id: Option<&str>) -> TransportResult<header::HeaderMap> {
        let mut map = header::HeaderMap::new();
        map.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
        map.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json, text/event-stream"),
        );
        for (k, v) in &self.config.headers {
            let name = header::HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;
            let value = header::HeaderValue::from_str(v)
                .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;
            map.insert(name, value);
        }
        if let Some(sid) = session_id {
            let name = header::HeaderName::from_bytes(self.config.session_id_header.as_bytes())
                .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;
            let value = header::HeaderValue::from_str(sid)
                .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;
            map.insert(name, value);
        }
        Ok(map)
    }

    /// Inspect a `401` response and surface it as an `OAuthChallenge` when a
    /// `resource_metadata` URL is present, falling back to a generic
    /// `AuthRequired`-shaped error otherwise.
    fn challenge_from_401(&self, response: &reqwest::Response) -> TransportError {
        if let Some(www_auth) = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
        {
            if let Some(url) = parse_resource_metadata_challenge(www_auth) {
                return TransportError::OAuthChallenge { resource_metadata_url: url };
            }
        }
        TransportError::OAuthChallenge { resource_metadata_url: self.config.endpoint.clone() }
    }

    async fn start_sse_listener(&self) -> TransportResult<()> {
        let url = Url::parse(&self.config.endpoint)
            .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;
        let headers = self.headers(self.session_id.lock().await.as_deref())?;
        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(self.challenge_from_401(&response));
        }
        if !response.status().is_success() {
            return Err(TransportError::ConnectionFailed(format!(
                "SSE endpoint returned {}",
                response.status()
            )));
        }

        let (tx, rx) = mpsc::channel(256);
        *self.notifications_rx.lock().await = Some(rx);

        let handle = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buf = String::new();
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                let Ok(text) = std::str::from_utf8(&chunk) else { continue };
                buf.push_str(text);
                while let Some(pos) = buf.find("\n\n") {
                    let event = buf[..pos].to_string();
                    buf.drain(..pos + 2);
                    for line in event.lines() {
                        if let Some(data) = line.strip_prefix("data:") {
                            let msg = TransportMessage {
                                payload: data.trim().to_string().into_bytes().into(),
                                metadata: TransportMessageMetadata::default(),
                            };
                            if tx.send(msg).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
        *self.sse_task.lock().await = Some(handle);
        Ok(())
    }
}

impl Transport for HttpTransport {
    fn transport_kind(&self) -> TransportKind {
        self.config.kind
    }

    fn capabilities(&self) -> &TransportCapabilities {
        &self.capabilities
    }

    fn state(&self) -> Pin<Box<dyn Future<Output = TransportState> + Send + '_>> {
        Box::pin(async move { self.state.lock().await.clone() })
    }

    fn open(&self) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>> {
        Box::pin(async move {
            *self.state.lock().await = TransportState::Connecting;
            let result = if matches!(self.config.kind, TransportKind::Sse | TransportKind::StreamableHttp) {
                self.start_sse_listener().await
            } else {
                Url::parse(&self.config.endpoint)
                    .map(|_| ())
                    .map_err(|e| TransportError::ConfigurationError(e.to_string()))
            };
            match result {
                Ok(()) => {
                    *self.state.lock().await = TransportState::Connected;
                    Ok(())
                }
                Err(e) => {
                    *self.state.lock().await = TransportState::Failed { reason: e.to_string() };
                    Err(e)
                }
            }
        })
    }

    fn request(
        &self,
        method: String,
        params: Option<serde_json::Value>,
        timeout: TimeoutConfig,
    ) -> Pin<Box<dyn Future<Output = TransportResult<serde_json::Value>> + Send + '_>> {
        Box::pin(async move {
            let url = Url::parse(&self.config.endpoint)
                .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;
            let body = serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params.unwrap_or(serde_json::Value::Null),
            });
            let headers = self.headers(self.session_id.lock().await.as_deref())?;

            let response = tokio::time::timeout(
                timeout.request,
                self.client.post(url).headers(headers).json(&body).send(),
            )
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(self.challenge_from_401(&response));
            }
            if let Some(sid) = response
                .headers()
                .get(self.config.session_id_header.as_str())
                .and_then(|v| v.to_str().ok())
            {
                *self.session_id.lock().await = Some(sid.to_string());
            }
            if !response.status().is_success() {
                return Err(TransportError::ProtocolError(format!(
                    "upstream returned {}",
                    response.status()
                )));
            }

            let value: serde_json::Value = response
                .json()
                .await
                .map_err(|e| TransportError::SerializationFailed(e.to_string()))?;
            if let Some(error) = value.get("error") {
                return Err(TransportError::ProtocolError(error.to_string()));
            }
            Ok(value.get("result").cloned().unwrap_or(serde_json::Value::Null))
        })
    }

    fn notify(
        &self,
        method: String,
        params: Option<serde_json::Value>,
    ) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>> {
        Box::pin(async move {
            let url = Url::parse(&self.config.endpoint)
                .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;
            let body = serde_json::json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params.unwrap_or(serde_json::Value::Null),
            });
            let headers = self.headers(self.session_id.lock().await.as_deref())?;
            let response = self
                .client
                .post(url)
                .headers(headers)
                .json(&body)
                .send()
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
            if response.status() == StatusCode::UNAUTHORIZED {
                return Err(self.challenge_from_401(&response));
            }
            trace!(status = %response.status(), "notification sent");
            Ok(())
        })
    }

    fn next_notification(
        &self,
    ) -> Pin<Box<dyn Future<Output = Option<TransportMessage>> + Send + '_>> {
        Box::pin(async move {
            let mut guard = self.notifications_rx.lock().await;
            match guard.as_mut() {
                Some(rx) => rx.recv().await,
                None => None,
            }
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>> {
        Box::pin(async move {
            if let Some(handle) = self.sse_task.lock().await.take() {
                handle.abort();
            }
            *self.notifications_rx.lock().await = None;
            *self.state.lock().await = TransportState::Disconnected;
            Ok(())
        })
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.config.endpoint.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resource_metadata_from_www_authenticate() {
        let header = r#"Bearer realm="mcp", resource_metadata="https://example.com/.well-known/oauth-protected-resource""#;
        let parsed = parse_resource_metadata_challenge(header);
        assert_eq!(parsed.as_deref(), Some("https://example.com/.well-known/oauth-protected-resource"));
    }

    #[test]
    fn missing_resource_metadata_returns_none() {
        let header = r#"Bearer realm="mcp""#;
        assert!(parse_resource_metadata_challenge(header).is_none());
    }

    #[test]
    fn streamable_and_sse_support_notifications() {
        let cfg = HttpTransportConfig::new(TransportKind::StreamableHttp, "http://localhost/mcp");
        let t = HttpTransport::new(cfg).unwrap();
        assert!(t.capabilities().supports_notifications);

        let cfg = HttpTransportConfig::new(TransportKind::Http, "http://localhost/mcp");
        let t = HttpTransport::new(cfg).unwrap();
        assert!(!t.capabilities().supports_notifications);
    }
}
