//! Boots one proxy instance from an in-process [`ProxyConfig`] for
//! smoke-testing. No CLI argument parsing, no config-file loading, no
//! REST/SSE surface — an embedder wanting those wires them up around
//! [`mcpproxy::ProxyHandle`] itself.

use mcpproxy::{ProxyConfig, ProxyHandle};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ProxyConfig::default();
    match ProxyHandle::start(config).await {
        Ok(handle) => {
            let report = handle.diagnostics().await;
            tracing::info!(clean = report.is_clean(), "proxy core booted with no configured servers");
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start proxy core");
            std::process::exit(1);
        }
    }
}
