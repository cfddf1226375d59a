//! Localhost OAuth redirect callback: binds the
//! previously stored preferred port, falling back to an ephemeral one and
//! triggering re-registration when that port is taken.

use std::collections::HashMap;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::debug;

use crate::error::{AuthError, AuthResult};

/// The authorization code (and echoed `state`) captured off one redirect.
#[derive(Debug, Clone)]
pub struct CallbackResult {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// A bound localhost callback listener, ready to accept exactly one
/// redirect from the system browser.
pub struct CallbackServer {
    listener: TcpListener,
    port: u16,
}

impl CallbackServer {
    /// Try binding a localhost callback on the previously stored preferred
    /// port first; if that's occupied, bind an ephemeral port instead and
    /// let the caller re-run DCR with the new redirect URI.
    pub async fn bind(preferred_port: Option<u16>) -> AuthResult<Self> {
        if let Some(port) = preferred_port {
            if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
                return Ok(Self { listener, port });
            }
            debug!(port, "preferred callback port unavailable, falling back to ephemeral");
        }
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|_| AuthError::CallbackBindFailed)?;
        let port = listener.local_addr().map_err(|_| AuthError::CallbackBindFailed)?.port();
        Ok(Self { listener, port })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}/callback", self.port)
    }

    /// Accept exactly one HTTP GET request carrying the authorization
    /// response on its query string, reply with a human-friendly page, and
    /// shut the listener down.
    pub async fn accept_once(self) -> AuthResult<CallbackResult> {
        let (mut stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| AuthError::Internal(format!("callback accept failed: {e}")))?;

        let mut buf = [0u8; 8192];
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| AuthError::Internal(format!("callback read failed: {e}")))?;
        let request = String::from_utf8_lossy(&buf[..n]);
        let query = parse_request_query(&request).unwrap_or_default();
        let params = parse_query_params(&query);

        let body = if params.contains_key("error") {
            "<html><body>Authorization failed. You may close this window.</body></html>"
        } else {
            "<html><body>Authorization complete. You may close this window.</body></html>"
        };
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;

        Ok(CallbackResult {
            code: params.get("code").cloned(),
            state: params.get("state").cloned(),
            error: params.get("error").cloned(),
        })
    }
}

fn parse_request_query(request: &str) -> Option<String> {
    let request_line = request.lines().next()?;
    let mut parts = request_line.split_whitespace();
    let _method = parts.next()?;
    let target = parts.next()?;
    let (_, query) = target.split_once('?')?;
    Some(query.to_string())
}

fn parse_query_params(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let decoded = percent_encoding::percent_decode_str(v).decode_utf8().ok()?.to_string();
            Some((k.to_string(), decoded))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_code_and_state_from_request_line() {
        let request = "GET /callback?code=abc123&state=xyz HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n";
        let query = parse_request_query(request).unwrap();
        let params = parse_query_params(&query);
        assert_eq!(params.get("code").map(String::as_str), Some("abc123"));
        assert_eq!(params.get("state").map(String::as_str), Some("xyz"));
    }

    #[test]
    fn parses_error_response() {
        let request = "GET /callback?error=access_denied&state=xyz HTTP/1.1\r\n\r\n";
        let query = parse_request_query(request).unwrap();
        let params = parse_query_params(&query);
        assert_eq!(params.get("error").map(String::as_str), Some("access_denied"));
    }

    #[tokio::test]
    async fn falls_back_to_ephemeral_port_when_preferred_is_taken() {
        let held = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let taken_port = held.local_addr().unwrap().port();

        let server = CallbackServer::bind(Some(taken_port)).await.unwrap();
        assert_ne!(server.port(), taken_port);
    }

    #[tokio::test]
    async fn binds_preferred_port_when_free() {
        let probe = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let free_port = probe.local_addr().unwrap().port();
        drop(probe);

        let server = CallbackServer::bind(Some(free_port)).await.unwrap();
        assert_eq!(server.port(), free_port);
    }
}
