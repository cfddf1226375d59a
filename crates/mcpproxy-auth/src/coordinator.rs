//! OAuth Flow Coordinator: serialises concurrent authentications
//! per server, runs the scope/DCR/PKCE/token-exchange pipeline, and owns the
//! proactive background refresher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{info, instrument, warn};
use url::Url;

use crate::callback::CallbackServer;
use crate::dcr::{DcrClient, RegistrationRequest};
use crate::discovery::{AuthorizationServerMetadata, ScopeDiscoverer};
use crate::error::{AuthError, AuthResult};
use crate::pkce::{generate_state, PkcePair};
use crate::store::{url_hash16, DynTokenStore};
use crate::types::{ClientCredentials, CompletionEvent, FlowOutcome, FlowState, OAuthFlowContext, OAuthTokenRecord};

/// How long a caller will wait for someone else's in-flight flow before
/// giving up ("additional callers wait up to 5 minutes").
const WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// A context with no activity for this long is considered abandoned and
/// reclaimed ("stale contexts are reclaimed after 10 min").
const STALE_RECLAIM: Duration = Duration::from_secs(10 * 60);
/// Proactive refresh fires once a token is within this margin of expiry.
const REFRESH_THRESHOLD: Duration = Duration::from_secs(5 * 60);
/// At most one browser launch per server per window.
const BROWSER_LAUNCH_WINDOW: Duration = Duration::from_secs(30);
const MAX_REFRESH_ATTEMPTS: u32 = 3;

/// What the coordinator needs to drive one server's authorization flow end
/// to end, gathered up front so the pipeline itself stays pure logic.
#[derive(Debug, Clone)]
pub struct ServerAuthConfig {
    pub server_name: String,
    /// The MCP endpoint this server is reachable at; used as the RFC 8707
    /// `resource` parameter on both `/authorize` and `/token`.
    pub resource: String,
    pub configured_scopes: Vec<String>,
    pub issuer: Option<String>,
    pub preferred_callback_port: Option<u16>,
    pub user_client_id: Option<String>,
}

/// Injected collaborator that opens the system browser at a URL. Out of
/// scope to implement for real (platform process spawning); tests and
/// headless embedders supply a no-op.
pub trait BrowserLauncher: Send + Sync + std::fmt::Debug {
    fn launch(&self, url: &str) -> AuthResult<()>;
}

/// A launcher that records the URL instead of opening anything, for
/// headless/test environments.
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    pub launched: Mutex<Vec<String>>,
}

impl BrowserLauncher for RecordingLauncher {
    fn launch(&self, url: &str) -> AuthResult<()> {
        if let Ok(mut guard) = self.launched.try_lock() {
            guard.push(url.to_string());
        }
        Ok(())
    }
}

struct InFlight {
    context: OAuthFlowContext,
    sender: watch::Sender<Option<FlowOutcome>>,
}

/// Central per-server serialisation point. One instance is shared across
/// every core connection in the process.
pub struct OAuthFlowCoordinator {
    store: DynTokenStore,
    http: reqwest::Client,
    discoverer: ScopeDiscoverer,
    launcher: Arc<dyn BrowserLauncher>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    launch_gate: Mutex<HashMap<String, SystemTime>>,
    refresh_semaphore: Arc<Semaphore>,
}

impl std::fmt::Debug for OAuthFlowCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthFlowCoordinator").finish_non_exhaustive()
    }
}

impl OAuthFlowCoordinator {
    #[must_use]
    pub fn new(store: DynTokenStore, launcher: Arc<dyn BrowserLauncher>) -> Self {
        let http = reqwest::Client::new();
        Self {
            discoverer: ScopeDiscoverer::new(http.clone()),
            http,
            store,
            launcher,
            in_flight: Mutex::new(HashMap::new()),
            launch_gate: Mutex::new(HashMap::new()),
            refresh_semaphore: Arc::new(Semaphore::new(8)),
        }
    }

    /// Returns the currently active flow correlation ids, for diagnostics.
    pub async fn active_flows(&self) -> Vec<(String, uuid::Uuid)> {
        self.in_flight
            .lock()
            .await
            .values()
            .map(|f| (f.context.server_name.clone(), f.context.correlation_id))
            .collect()
    }

    /// Look up a stored, still-valid token without starting a flow. Used
    /// for the round-trip property: restart + dispatch must
    /// succeed from persisted tokens alone.
    pub async fn stored_token(&self, server_name: &str, resource: &str) -> AuthResult<Option<OAuthTokenRecord>> {
        let hash = url_hash16(resource);
        self.store.get(server_name, &hash).await
    }

    /// Entry point: ensure `server_name` has a valid access token, running
    /// (or joining) a flow if necessary. At most one flow is ever in flight
    /// per server.
    #[instrument(skip(self, config), fields(server_name = %config.server_name))]
    pub async fn ensure_authenticated(&self, config: &ServerAuthConfig) -> AuthResult<OAuthTokenRecord> {
        if let Some(token) = self.stored_token(&config.server_name, &config.resource).await? {
            if !token.is_expired(SystemTime::now()) && !token.user_logged_out {
                return Ok(token);
            }
            if token.user_logged_out {
                return Err(AuthError::LoggedOut);
            }
        }

        let mut guard = self.in_flight.lock().await;
        if let Some(existing) = guard.get(&config.server_name) {
            if !existing.context.is_stale(SystemTime::now(), STALE_RECLAIM) {
                let mut receiver = existing.sender.subscribe();
                drop(guard);
                return self.await_outcome(&mut receiver).await;
            }
        }

        let context = OAuthFlowContext::new(config.server_name.clone());
        let (sender, mut receiver) = watch::channel(None);
        guard.insert(config.server_name.clone(), InFlight { context: context.clone(), sender: sender.clone() });
        drop(guard);

        let outcome = self.run_flow(config, &context).await;
        sender.send_replace(Some(match &outcome {
            Ok(token) => FlowOutcome::Token(token.clone()),
            Err(e) => FlowOutcome::Failed(e.to_string()),
        }));
        self.in_flight.lock().await.remove(&config.server_name);
        let _ = receiver.changed().await;

        outcome
    }

    async fn await_outcome(&self, receiver: &mut watch::Receiver<Option<FlowOutcome>>) -> AuthResult<OAuthTokenRecord> {
        let wait = tokio::time::timeout(WAIT_TIMEOUT, receiver.changed());
        match wait.await {
            Ok(Ok(())) => match receiver.borrow().clone() {
                Some(FlowOutcome::Token(token)) => Ok(token),
                Some(FlowOutcome::Failed(msg)) => Err(AuthError::TokenExchangeFailed(msg)),
                None => Err(AuthError::Internal("flow channel closed without outcome".into())),
            },
            Ok(Err(_)) => Err(AuthError::Internal("flow sender dropped".into())),
            Err(_) => Err(AuthError::WaitTimeout),
        }
    }

    /// Runs the full pipeline once this caller won the right to do so.
    async fn run_flow(&self, config: &ServerAuthConfig, context: &OAuthFlowContext) -> AuthResult<OAuthTokenRecord> {
        let correlation_id = context.correlation_id;
        info!(%correlation_id, server_name = %config.server_name, "starting oauth flow");

        // Step 1: scope waterfall.
        let resolution = self
            .discoverer
            .resolve(&config.configured_scopes, None, config.issuer.as_deref())
            .await;

        let as_metadata = match &resolution.as_metadata {
            Some(m) => m.clone(),
            None => match &config.issuer {
                Some(issuer) => self
                    .discoverer
                    .fetch_authorization_server_metadata(issuer)
                    .await
                    .map_err(|_| AuthError::AuthRequiredManual)?,
                None => return Err(AuthError::AuthRequiredManual),
            },
        };

        // Step 2: client registration, reusing stored credentials if present.
        let stored_credentials = self.store.get_credentials(&config.server_name).await?;
        let credentials = self
            .obtain_credentials(config, &as_metadata, stored_credentials)
            .await?;

        // Steps 3-5: callback server, authorize URL, browser launch, token exchange.
        let should_launch = self.rate_limit_launch(&config.server_name).await;
        let callback = CallbackServer::bind(Some(credentials.callback_port)).await?;
        let credentials = if callback.port() != credentials.callback_port {
            // Preferred port was taken; the bound redirect_uri changed, so
            // the authorization server needs a fresh registration.
            let refreshed = self.register_client(config, &as_metadata, &callback).await?;
            self.store.save_credentials(&config.server_name, refreshed.clone()).await?;
            refreshed
        } else {
            credentials
        };

        let pkce = PkcePair::generate();
        let state = generate_state();
        let authorize_url = build_authorize_url(
            &as_metadata.authorization_endpoint,
            &credentials,
            &resolution.scopes,
            &state,
            &pkce,
            &config.resource,
        )?;

        if should_launch {
            self.launcher.launch(authorize_url.as_str())?;
        } else {
            info!(%correlation_id, server_name = %config.server_name, "browser launch rate-limited, reusing caller's open tab");
        }
        let callback_result = callback.accept_once().await?;

        if let Some(error) = callback_result.error {
            warn!(%correlation_id, %error, "authorization denied by resource owner");
            return Err(AuthError::UserDenied);
        }
        if callback_result.state.as_deref() != Some(state.as_str()) {
            return Err(AuthError::TokenExchangeFailed("state mismatch".into()));
        }
        let code = callback_result.code.ok_or_else(|| AuthError::TokenExchangeFailed("missing code".into()))?;

        let token = self
            .exchange_code(&config.server_name, &as_metadata, &credentials, &code, &pkce, &config.resource)
            .await?;

        let hash = url_hash16(&config.resource);
        self.store.save(token.clone(), &hash).await?;
        self.store
            .record_completion(CompletionEvent {
                server_name: config.server_name.clone(),
                succeeded: true,
                occurred_at: unix_now(),
            })
            .await?;

        info!(%correlation_id, "oauth flow completed");
        Ok(token)
    }

    async fn obtain_credentials(
        &self,
        config: &ServerAuthConfig,
        as_metadata: &AuthorizationServerMetadata,
        stored: Option<ClientCredentials>,
    ) -> AuthResult<ClientCredentials> {
        if let Some(creds) = stored {
            return Ok(creds);
        }
        let probe = CallbackServer::bind(config.preferred_callback_port).await?;
        match self.register_client(config, as_metadata, &probe).await {
            Ok(creds) => {
                self.store.save_credentials(&config.server_name, creds.clone()).await?;
                Ok(creds)
            }
            Err(AuthError::DcrUnsupported) => {
                if let Some(client_id) = &config.user_client_id {
                    Ok(ClientCredentials {
                        client_id: client_id.clone(),
                        client_secret: None,
                        redirect_uri: probe.redirect_uri(),
                        callback_port: probe.port(),
                    })
                } else {
                    Err(AuthError::AuthRequiredManual)
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn register_client(
        &self,
        config: &ServerAuthConfig,
        as_metadata: &AuthorizationServerMetadata,
        callback: &CallbackServer,
    ) -> AuthResult<ClientCredentials> {
        let endpoint = as_metadata.registration_endpoint.clone().ok_or(AuthError::DcrUnsupported)?;
        let dcr = DcrClient::new(endpoint, self.http.clone());
        let request = RegistrationRequest::mcp_client("mcpproxy", callback.redirect_uri())
            .with_scopes(&config.configured_scopes);
        let response = dcr.register(request).await?;
        Ok(ClientCredentials {
            client_id: response.client_id,
            client_secret: response.client_secret,
            redirect_uri: callback.redirect_uri(),
            callback_port: callback.port(),
        })
    }

    async fn exchange_code(
        &self,
        server_name: &str,
        as_metadata: &AuthorizationServerMetadata,
        credentials: &ClientCredentials,
        code: &str,
        pkce: &PkcePair,
        resource: &str,
    ) -> AuthResult<OAuthTokenRecord> {
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", credentials.redirect_uri.clone()),
            ("client_id", credentials.client_id.clone()),
            ("code_verifier", pkce.verifier.clone()),
            ("resource", resource.to_string()),
        ];
        if let Some(secret) = &credentials.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = self
            .http
            .post(&as_metadata.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::TokenExchangeFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::TokenExchangeFailed(format!("token endpoint returned {}", response.status())));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::TokenExchangeFailed(format!("malformed token response: {e}")))?;

        Ok(token_record_from_response(server_name, body, credentials))
    }

    /// Refresh a stored token using its refresh_token.
    /// Never attempted without a refresh token; bounded retries before
    /// escalating back to a fresh authorization flow.
    pub async fn refresh(&self, config: &ServerAuthConfig, as_metadata: &AuthorizationServerMetadata) -> AuthResult<OAuthTokenRecord> {
        let _permit = self.refresh_semaphore.acquire().await.map_err(|_| AuthError::Cancelled)?;
        let hash = url_hash16(&config.resource);
        let Some(mut record) = self.store.get(&config.server_name, &hash).await? else {
            return Err(AuthError::NoRefreshToken);
        };
        if record.user_logged_out {
            return Err(AuthError::LoggedOut);
        }
        let Some(refresh_token) = record.refresh_token.clone() else {
            return Err(AuthError::NoRefreshToken);
        };

        let mut last_err = None;
        for attempt in 0..MAX_REFRESH_ATTEMPTS {
            match self.do_refresh(as_metadata, &record, &refresh_token).await {
                Ok(updated) => {
                    record = updated;
                    self.store.save(record.clone(), &hash).await?;
                    return Ok(record);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "token refresh attempt failed");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(200 * 2u64.pow(attempt))).await;
                }
            }
        }
        Err(last_err.unwrap_or(AuthError::RefreshFailed("unknown".into())))
    }

    async fn do_refresh(
        &self,
        as_metadata: &AuthorizationServerMetadata,
        record: &OAuthTokenRecord,
        refresh_token: &str,
    ) -> AuthResult<OAuthTokenRecord> {
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        if let Some(client_id) = &record.client_id {
            form.push(("client_id", client_id.clone()));
        }
        if let Some(secret) = &record.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = self
            .http
            .post(&as_metadata.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::RefreshFailed(format!("token endpoint returned {}", response.status())));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::RefreshFailed(format!("malformed refresh response: {e}")))?;

        let mut updated = record.clone();
        updated.access_token = body.access_token;
        if let Some(new_refresh) = body.refresh_token {
            updated.refresh_token = Some(new_refresh);
        }
        updated.expires_at = body.expires_in.map(|secs| unix_now() + secs as i64);
        updated.updated_at = unix_now();
        Ok(updated)
    }

    /// True if `server_name`'s token needs a refresh given the standard
    /// threshold.
    pub fn needs_refresh(token: &OAuthTokenRecord) -> bool {
        !token.user_logged_out && token.refresh_token.is_some() && token.needs_refresh(SystemTime::now(), REFRESH_THRESHOLD)
    }

    /// At most one browser launch per server per [`BROWSER_LAUNCH_WINDOW`]
    /// — returns whether this caller is clear to launch.
    /// A caller denied the launch still proceeds to wait on the callback;
    /// this only suppresses redundant popups from reconnect storms.
    async fn rate_limit_launch(&self, server_name: &str) -> bool {
        let mut gate = self.launch_gate.lock().await;
        let now = SystemTime::now();
        if let Some(last) = gate.get(server_name) {
            if now.duration_since(*last).unwrap_or(Duration::ZERO) < BROWSER_LAUNCH_WINDOW {
                return false;
            }
        }
        gate.insert(server_name.to_string(), now);
        true
    }
}

/// Spawns the proactive refresher loop: one tick per `interval`, refreshing
/// any server whose stored token is within threshold and hasn't been
/// logged out.
pub fn spawn_refresher(
    coordinator: Arc<OAuthFlowCoordinator>,
    servers: Vec<ServerAuthConfig>,
    as_metadata: HashMap<String, AuthorizationServerMetadata>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for config in &servers {
                let Some(metadata) = as_metadata.get(&config.server_name) else { continue };
                let hash = url_hash16(&config.resource);
                let Ok(Some(token)) = coordinator.store.get(&config.server_name, &hash).await else { continue };
                if OAuthFlowCoordinator::needs_refresh(&token) {
                    if let Err(e) = coordinator.refresh(config, metadata).await {
                        warn!(server_name = %config.server_name, error = %e, "proactive refresh failed");
                    }
                }
            }
        }
    })
}

#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
    scope: Option<String>,
}

fn token_record_from_response(server_name: &str, body: TokenResponse, credentials: &ClientCredentials) -> OAuthTokenRecord {
    let now = unix_now();
    OAuthTokenRecord {
        server_name: server_name.to_string(),
        access_token: body.access_token,
        refresh_token: body.refresh_token,
        token_type: body.token_type.unwrap_or_else(|| "Bearer".to_string()),
        expires_at: body.expires_in.map(|s| now + s as i64),
        scopes: body.scope.map(|s| s.split(' ').map(str::to_string).collect()).unwrap_or_default(),
        client_id: Some(credentials.client_id.clone()),
        client_secret: credentials.client_secret.clone(),
        callback_port: Some(credentials.callback_port),
        redirect_uri: Some(credentials.redirect_uri.clone()),
        user_logged_out: false,
        created_at: now,
        updated_at: now,
    }
}

/// Builds the `/authorize` URL: `response_type=code`, PKCE `S256`, `state`,
/// RFC 8707 `resource` (always present), and `scope`.
fn build_authorize_url(
    endpoint: &str,
    credentials: &ClientCredentials,
    scopes: &[String],
    state: &str,
    pkce: &PkcePair,
    resource: &str,
) -> AuthResult<Url> {
    let mut url = Url::parse(endpoint).map_err(|e| AuthError::Internal(format!("invalid authorize endpoint: {e}")))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("response_type", "code");
        pairs.append_pair("client_id", &credentials.client_id);
        pairs.append_pair("redirect_uri", &credentials.redirect_uri);
        pairs.append_pair("state", state);
        pairs.append_pair("code_challenge", &pkce.challenge);
        pairs.append_pair("code_challenge_method", "S256");
        pairs.append_pair("resource", resource);
        if !scopes.is_empty() {
            pairs.append_pair("scope", &scopes.join(" "));
        }
    }
    Ok(url)
}

fn unix_now() -> i64 {
    SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_credentials() -> ClientCredentials {
        ClientCredentials {
            client_id: "client-123".into(),
            client_secret: None,
            redirect_uri: "http://127.0.0.1:54120/callback".into(),
            callback_port: 54120,
        }
    }

    #[test]
    fn authorize_url_always_carries_resource_and_pkce() {
        let pkce = PkcePair::generate();
        let url = build_authorize_url(
            "https://auth.example.com/authorize",
            &sample_credentials(),
            &["mcp:tools".to_string()],
            "state-abc",
            &pkce,
            "https://upstream.example.com/mcp",
        )
        .unwrap();
        let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query.get("resource").map(String::as_str), Some("https://upstream.example.com/mcp"));
        assert_eq!(query.get("code_challenge_method").map(String::as_str), Some("S256"));
        assert!(!query.get("state").unwrap().is_empty());
        assert_eq!(query.get("response_type").map(String::as_str), Some("code"));
    }

    #[test]
    fn needs_refresh_is_false_once_logged_out() {
        let mut token = OAuthTokenRecord {
            server_name: "s".into(),
            access_token: "a".into(),
            refresh_token: Some("r".into()),
            token_type: "Bearer".into(),
            expires_at: Some(0),
            scopes: vec![],
            client_id: None,
            client_secret: None,
            callback_port: None,
            redirect_uri: None,
            user_logged_out: false,
            created_at: 0,
            updated_at: 0,
        };
        assert!(OAuthFlowCoordinator::needs_refresh(&token));
        token.user_logged_out = true;
        assert!(!OAuthFlowCoordinator::needs_refresh(&token));
    }

    #[test]
    fn needs_refresh_requires_refresh_token() {
        let token = OAuthTokenRecord {
            server_name: "s".into(),
            access_token: "a".into(),
            refresh_token: None,
            token_type: "Bearer".into(),
            expires_at: Some(0),
            scopes: vec![],
            client_id: None,
            client_secret: None,
            callback_port: None,
            redirect_uri: None,
            user_logged_out: false,
            created_at: 0,
            updated_at: 0,
        };
        assert!(!OAuthFlowCoordinator::needs_refresh(&token));
    }

    #[tokio::test]
    async fn rate_limit_launch_only_clears_once_per_window() {
        let coordinator = OAuthFlowCoordinator::new(
            Arc::new(crate::store::InMemoryTokenStore::new()),
            Arc::new(RecordingLauncher::default()),
        );
        assert!(coordinator.rate_limit_launch("acme").await);
        assert!(!coordinator.rate_limit_launch("acme").await);
        assert!(coordinator.rate_limit_launch("other-server").await);
    }
}
