//! RFC 7591 Dynamic Client Registration: register a fresh OAuth client with
//! a discovered authorization server when no `client_id` is stored yet.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{AuthError, AuthResult};

/// Registration request per RFC 7591 §2.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationRequest {
    pub redirect_uris: Vec<String>,
    pub token_endpoint_auth_method: String,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub client_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl RegistrationRequest {
    /// The standard shape an MCP client registers with: public client
    /// (`none` token auth), authorization_code + refresh_token grants.
    #[must_use]
    pub fn mcp_client(client_name: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            redirect_uris: vec![redirect_uri.into()],
            token_endpoint_auth_method: "none".to_string(),
            grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
            response_types: vec!["code".to_string()],
            client_name: client_name.into(),
            scope: None,
        }
    }

    #[must_use]
    pub fn with_scopes(mut self, scopes: &[String]) -> Self {
        if !scopes.is_empty() {
            self.scope = Some(scopes.join(" "));
        }
        self
    }
}

/// Registration response per RFC 7591 §3.2 (subset used by the coordinator).
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationResponse {
    pub client_id: String,
    pub client_secret: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Thin RFC 7591 client bound to one authorization server's registration
/// endpoint.
#[derive(Debug, Clone)]
pub struct DcrClient {
    endpoint: String,
    http: reqwest::Client,
}

impl DcrClient {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, http: reqwest::Client) -> Self {
        Self { endpoint: endpoint.into(), http }
    }

    /// Perform registration. A non-2xx response or connection failure maps
    /// to [`AuthError::DcrUnsupported`] — the coordinator treats this as
    /// non-fatal, falling back to a user-supplied `client_id` if one exists.
    pub async fn register(&self, request: RegistrationRequest) -> AuthResult<RegistrationResponse> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|_| AuthError::DcrUnsupported)?;

        if !response.status().is_success() {
            return Err(AuthError::DcrUnsupported);
        }

        response
            .json::<RegistrationResponse>()
            .await
            .map_err(|e| AuthError::InvalidDocument(format!("malformed DCR response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mcp_client_request_is_public_client_shape() {
        let req = RegistrationRequest::mcp_client("mcpproxy", "http://127.0.0.1:54123/callback")
            .with_scopes(&["mcp:tools".to_string(), "mcp:resources".to_string()]);
        assert_eq!(req.token_endpoint_auth_method, "none");
        assert_eq!(req.scope.as_deref(), Some("mcp:tools mcp:resources"));
        assert!(req.grant_types.contains(&"refresh_token".to_string()));
    }

    #[test]
    fn empty_scopes_omit_scope_field() {
        let req = RegistrationRequest::mcp_client("mcpproxy", "http://127.0.0.1:1/cb").with_scopes(&[]);
        assert!(req.scope.is_none());
    }
}
