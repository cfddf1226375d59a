//! Per-server OAuth Token Store and Flow Coordinator.
//!
//! This crate has no knowledge of MCP transports; it exchanges a
//! `{server_name, resource}` pair for a valid access token, persisting
//! everything it learns along the way (client credentials, callback port,
//! tokens) so a restarted process can resume without a new browser flow.

mod callback;
mod coordinator;
mod dcr;
mod discovery;
mod error;
mod pkce;
mod store;
mod types;

pub use callback::{CallbackResult, CallbackServer};
pub use coordinator::{spawn_refresher, BrowserLauncher, OAuthFlowCoordinator, RecordingLauncher, ServerAuthConfig};
pub use dcr::{DcrClient, RegistrationRequest, RegistrationResponse};
pub use discovery::{
    extract_resource_metadata_url, AuthorizationServerMetadata, ProtectedResourceMetadata, ScopeDiscoverer,
    ScopeResolution,
};
pub use error::{AuthError, AuthResult};
pub use pkce::{generate_state, PkcePair};
pub use store::{url_hash16, DynTokenStore, InMemoryTokenStore, SledTokenStore, TokenStore};
pub use types::{
    ClientCredentials, CompletionEvent, FlowOutcome, FlowState, OAuthFlowContext, OAuthTokenRecord, ScopeSource,
};
