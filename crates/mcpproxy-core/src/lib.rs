//! THE CORE: upstream connection lifecycle, tool dispatch, flow tracking
//! and diagnostics for the aggregating MCP proxy.
//!
//! This crate has no opinion about how it's exposed — no REST surface, no
//! CLI, no tray icon. [`manager::UpstreamManager`] and
//! [`dispatcher::ToolDispatcher`] are the two types an embedding binary
//! wires together; everything else here supports them.

mod activity;
mod config;
mod connection;
mod diagnostics;
mod dispatcher;
mod error;
mod events;
mod flow;
mod health;
mod intent;
mod managed_client;
mod manager;

pub use activity::{
    ActivityRecord, ActivityStore, ActivityType, DynActivityStore, InMemoryActivityStore, RetentionPolicy,
    SledActivityStore,
};
pub use config::{
    Endpoint, HttpEndpoint, OAuthServerConfig, ProxyConfig, ServerClassification, ServerConfig, StdioEndpoint,
};
pub use connection::{ConnState, CoreConnection, ExitOutcome, HandshakeResult, ToolsChangedCallback, TransportBuilder};
pub use diagnostics::{aggregate as aggregate_diagnostics, DiagnosticsEntry, DiagnosticsReport};
pub use dispatcher::ToolDispatcher;
pub use error::{ProxyError, ProxyErrorExt, ProxyResult};
pub use events::{EventBus, EventReason, ProxyEvent};
pub use flow::{
    classify_server, content_hashes, hash128, ContentHash, FlowContext, FlowTracker, HookAdapter, HookAdapterError,
    HookEvaluation, NoopHookAdapter, NoopSensitiveDataDetector, PolicyDecision, RiskLevel, SensitiveDataDetector,
};
pub use health::{AdminState, ConnectionState, HealthAction, HealthLevel, HealthStatus, OAuthState};
pub use intent::{IntentDeclaration, OperationType};
pub use managed_client::ManagedClient;
pub use manager::UpstreamManager;
