//! Scope resolution waterfall: user config, then RFC 9728
//! Protected Resource Metadata, then RFC 8414 Authorization Server Metadata,
//! then empty scopes. Every network step has its own 5s timeout and falls
//! through on timeout, 404, or malformed JSON — never hard-fails the flow.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::{AuthError, AuthResult};
use crate::types::ScopeSource;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// RFC 9728 `/.well-known/oauth-protected-resource` document (subset).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtectedResourceMetadata {
    pub resource: String,
    #[serde(default)]
    pub authorization_servers: Vec<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

/// RFC 8414 `/.well-known/oauth-authorization-server` document (subset
/// needed by the flow coordinator).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

/// Result of running the full scope waterfall for one server.
#[derive(Debug, Clone)]
pub struct ScopeResolution {
    pub scopes: Vec<String>,
    pub source: ScopeSource,
    /// Populated once AS metadata is fetched, so the coordinator can proceed
    /// straight to DCR/authorize without a second round trip.
    pub as_metadata: Option<AuthorizationServerMetadata>,
}

/// Parses the `resource_metadata="..."` parameter out of a `401`'s
/// `WWW-Authenticate` header (used by the transport layer too, but
/// duplicated here narrowly to keep the auth crate transport-independent).
#[must_use]
pub fn extract_resource_metadata_url(www_authenticate: &str) -> Option<String> {
    www_authenticate.split(',').find_map(|part| {
        let part = part.trim();
        let rest = part.strip_prefix("resource_metadata=")?;
        Some(rest.trim_matches('"').to_string())
    })
}

/// Fetches and runs the scope discovery waterfall.
pub struct ScopeDiscoverer {
    client: reqwest::Client,
}

impl ScopeDiscoverer {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Run the full waterfall. `configured_scopes` wins outright — when set,
    /// discovery is skipped entirely. `resource_metadata_url` is the URL
    /// surfaced by a `401` challenge, if one occurred.
    pub async fn resolve(
        &self,
        configured_scopes: &[String],
        resource_metadata_url: Option<&str>,
        issuer: Option<&str>,
    ) -> ScopeResolution {
        if !configured_scopes.is_empty() {
            return ScopeResolution {
                scopes: configured_scopes.to_vec(),
                source: ScopeSource::UserConfigured,
                as_metadata: None,
            };
        }

        if let Some(url) = resource_metadata_url {
            match self.fetch_protected_resource_metadata(url).await {
                Ok(prm) if !prm.scopes_supported.is_empty() => {
                    return ScopeResolution {
                        scopes: prm.scopes_supported,
                        source: ScopeSource::ProtectedResourceMetadata,
                        as_metadata: None,
                    };
                }
                Ok(_) => debug!("protected resource metadata had no scopes, falling through"),
                Err(e) => debug!(error = %e, "protected resource metadata fetch failed, falling through"),
            }
        }

        if let Some(issuer) = issuer {
            match self.fetch_authorization_server_metadata(issuer).await {
                Ok(meta) if !meta.scopes_supported.is_empty() => {
                    let scopes = meta.scopes_supported.clone();
                    return ScopeResolution {
                        scopes,
                        source: ScopeSource::AuthorizationServerMetadata,
                        as_metadata: Some(meta),
                    };
                }
                Ok(meta) => {
                    debug!("authorization server metadata had no scopes, falling through");
                    return ScopeResolution {
                        scopes: vec![],
                        source: ScopeSource::EmptyDefault,
                        as_metadata: Some(meta),
                    };
                }
                Err(e) => warn!(error = %e, "authorization server metadata fetch failed"),
            }
        }

        ScopeResolution { scopes: vec![], source: ScopeSource::EmptyDefault, as_metadata: None }
    }

    async fn fetch_protected_resource_metadata(
        &self,
        url: &str,
    ) -> AuthResult<ProtectedResourceMetadata> {
        self.fetch_json(url).await
    }

    /// Fetches AS metadata directly from an issuer's well-known path.
    pub async fn fetch_authorization_server_metadata(
        &self,
        issuer: &str,
    ) -> AuthResult<AuthorizationServerMetadata> {
        let mut url = Url::parse(issuer)
            .map_err(|e| AuthError::InvalidDocument(format!("invalid issuer url: {e}")))?;
        let path = url.path().trim_end_matches('/');
        let discovery_path = if path.is_empty() {
            "/.well-known/oauth-authorization-server".to_string()
        } else {
            format!("/.well-known/oauth-authorization-server{path}")
        };
        url.set_path(&discovery_path);
        self.fetch_json(url.as_str()).await
    }

    async fn fetch_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> AuthResult<T> {
        let response = tokio::time::timeout(DISCOVERY_TIMEOUT, self.client.get(url).send())
            .await
            .map_err(|_| AuthError::ScopeDiscoveryFailed(format!("timeout fetching {url}")))?
            .map_err(|e| AuthError::ScopeDiscoveryFailed(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AuthError::ScopeDiscoveryFailed(format!("{url} returned 404")));
        }
        if !response.status().is_success() {
            return Err(AuthError::ScopeDiscoveryFailed(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| AuthError::ScopeDiscoveryFailed(format!("malformed JSON from {url}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_resource_metadata_from_header() {
        let header = r#"Bearer resource_metadata="https://example.com/.well-known/oauth-protected-resource", error="invalid_token""#;
        assert_eq!(
            extract_resource_metadata_url(header).as_deref(),
            Some("https://example.com/.well-known/oauth-protected-resource")
        );
    }

    #[tokio::test]
    async fn configured_scopes_skip_discovery() {
        let discoverer = ScopeDiscoverer::new(reqwest::Client::new());
        let resolution = discoverer
            .resolve(&["mcp:tools".to_string()], Some("http://unreachable.invalid"), None)
            .await;
        assert_eq!(resolution.source, ScopeSource::UserConfigured);
        assert_eq!(resolution.scopes, vec!["mcp:tools".to_string()]);
    }

    #[tokio::test]
    async fn unreachable_metadata_falls_through_to_empty() {
        let discoverer = ScopeDiscoverer::new(reqwest::Client::new());
        let resolution = discoverer
            .resolve(&[], Some("http://127.0.0.1:1/.well-known/oauth-protected-resource"), None)
            .await;
        assert_eq!(resolution.source, ScopeSource::EmptyDefault);
        assert!(resolution.scopes.is_empty());
    }
}
