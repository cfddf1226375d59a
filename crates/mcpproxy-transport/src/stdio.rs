//! Stdio transport: owns a subprocess group speaking newline-delimited
//! JSON-RPC over its stdin/stdout.
//!
//! The child's stderr (and, for diagnosability, its raw stdout lines) are
//! captured into a bounded [`RingBuffer`] so the core connection can scan for
//! the well-known port-conflict substrings without re-reading the process's
//! output stream.

use std::collections::HashMap;
use std::process::Stdio as StdStdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tracing::{debug, trace, warn};

use crate::config::TimeoutConfig;
use crate::error::{TransportError, TransportResult};
use crate::message::{TransportMessage, TransportMessageMetadata};
use crate::ring_buffer::{detect_port_conflict, RingBuffer};
use crate::traits::Transport;
use crate::types::{ExitClass, ProcessExitSignal, TransportCapabilities, TransportKind, TransportState};

/// How the subprocess is launched and torn down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdioTransportConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    /// Byte cap for the captured stdout/stderr ring buffers.
    pub ring_buffer_bytes: usize,
}

impl Default for StdioTransportConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            ring_buffer_bytes: 64 * 1024,
        }
    }
}

struct PendingRequests {
    table: TokioMutex<HashMap<i64, oneshot::Sender<serde_json::Value>>>,
}

impl PendingRequests {
    fn new() -> Self {
        Self { table: TokioMutex::new(HashMap::new()) }
    }
}

/// Subprocess-backed transport. One instance owns one child process group
/// for the lifetime of the connection; reconnecting spawns a fresh one.
#[derive(Debug)]
pub struct StdioTransport {
    config: StdioTransportConfig,
    capabilities: TransportCapabilities,
    state: Arc<TokioMutex<TransportState>>,
    child: Arc<TokioMutex<Option<Child>>>,
    stdin_tx: Arc<TokioMutex<Option<mpsc::Sender<String>>>>,
    notifications_rx: Arc<TokioMutex<Option<mpsc::Receiver<TransportMessage>>>>,
    /// Guarded by a plain (non-async) mutex: every access is a single
    /// synchronous push/scan with no `.await` held across it, so the
    /// uncontended-lock cost of `parking_lot` beats `tokio::sync::Mutex`'s
    /// overhead here.
    stderr_ring: Arc<SyncMutex<RingBuffer>>,
    pending: Arc<PendingRequests>,
    next_id: AtomicI64,
    exit_signal: Arc<TokioMutex<Option<ProcessExitSignal>>>,
}

impl StdioTransport {
    #[must_use]
    pub fn new(config: StdioTransportConfig) -> Self {
        let ring_bytes = config.ring_buffer_bytes;
        Self {
            config,
            capabilities: TransportCapabilities {
                supports_notifications: true,
                supports_reconnect: true,
                max_message_size: Some(10 * 1024 * 1024),
            },
            state: Arc::new(TokioMutex::new(TransportState::Disconnected)),
            child: Arc::new(TokioMutex::new(None)),
            stdin_tx: Arc::new(TokioMutex::new(None)),
            notifications_rx: Arc::new(TokioMutex::new(None)),
            stderr_ring: Arc::new(SyncMutex::new(RingBuffer::new(ring_bytes))),
            pending: Arc::new(PendingRequests::new()),
            next_id: AtomicI64::new(1),
            exit_signal: Arc::new(TokioMutex::new(None)),
        }
    }

    /// Well-known exit classification from the last observed process exit,
    /// if any.
    pub async fn last_exit_signal(&self) -> Option<ProcessExitSignal> {
        *self.exit_signal.lock().await
    }

    pub async fn stderr_contains(&self, needle: &str) -> bool {
        self.stderr_ring.lock().contains(needle)
    }

    async fn spawn(&self) -> TransportResult<()> {
        if self.config.command.is_empty() {
            return Err(TransportError::ConfigurationError("stdio command is empty".into()));
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(StdStdio::piped())
            .stdout(StdStdio::piped())
            .stderr(StdStdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            // Put the child in its own process group so shutdown can signal
            // the whole group rather than just the immediate child.
            cmd.process_group(0);
        }

        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &self.config.env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::ConnectionFailed(format!("spawn failed: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("missing stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("missing stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("missing stderr".into()))?;

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            let mut writer = BufWriter::new(stdin);
            while let Some(line) = stdin_rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        let (notif_tx, notif_rx) = mpsc::channel::<TransportMessage>(256);
        let pending = self.pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        trace!(%line, "stdio transport received line");
                        let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
                            warn!(%line, "non-JSON line from upstream, dropping");
                            continue;
                        };
                        if let Some(id) = value.get("id").and_then(serde_json::Value::as_i64) {
                            if let Some(tx) = pending.table.lock().await.remove(&id) {
                                let _ = tx.send(value);
                                continue;
                            }
                        }
                        // No matching pending request: it's a server->client
                        // notification.
                        let msg = TransportMessage {
                            payload: line.clone().into_bytes().into(),
                            metadata: TransportMessageMetadata::default(),
                        };
                        if notif_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "stdio stdout read error");
                        break;
                    }
                }
            }
        });

        let stderr_ring = self.stderr_ring.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(%line, "upstream stderr");
                stderr_ring.lock().push(line);
            }
        });

        *self.stdin_tx.lock().await = Some(stdin_tx);
        *self.notifications_rx.lock().await = Some(notif_rx);
        *self.child.lock().await = Some(child);
        *self.state.lock().await = TransportState::Connected;
        Ok(())
    }

    /// Observe the child exit status and classify it, escalating to
    /// [`TransportError::PortConflict`] when either the exit code or the
    /// stderr ring buffer indicates a bind conflict.
    async fn observe_exit(&self, status: std::process::ExitStatus) {
        let port_conflict = detect_port_conflict(&self.stderr_ring.lock());
        let signal = ProcessExitSignal { code: status.code(), port_conflict_detected: port_conflict };
        *self.exit_signal.lock().await = Some(signal);
    }
}

impl Transport for StdioTransport {
    fn transport_kind(&self) -> TransportKind {
        TransportKind::Stdio
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
            match self.spawn().await {
                Ok(()) => Ok(()),
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
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            self.pending.table.lock().await.insert(id, tx);

            let mut request = serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
            });
            if let Some(params) = params {
                request["params"] = params;
            }
            let line = serde_json::to_string(&request)?;

            let sender = {
                let guard = self.stdin_tx.lock().await;
                guard.clone()
            };
            let Some(sender) = sender else {
                self.pending.table.lock().await.remove(&id);
                return Err(TransportError::NotAvailable("stdio transport not open".into()));
            };
            if sender.send(line).await.is_err() {
                self.pending.table.lock().await.remove(&id);
                return Err(TransportError::SendFailed("stdin closed".into()));
            }

            match tokio::time::timeout(timeout.request, rx).await {
                Ok(Ok(value)) => {
                    if let Some(error) = value.get("error") {
                        return Err(TransportError::ProtocolError(error.to_string()));
                    }
                    Ok(value.get("result").cloned().unwrap_or(serde_json::Value::Null))
                }
                Ok(Err(_)) => Err(TransportError::ConnectionLost("response channel dropped".into())),
                Err(_) => {
                    self.pending.table.lock().await.remove(&id);
                    Err(TransportError::Timeout)
                }
            }
        })
    }

    fn notify(
        &self,
        method: String,
        params: Option<serde_json::Value>,
    ) -> Pin<Box<dyn Future<Output = TransportResult<()>> + Send + '_>> {
        Box::pin(async move {
            let mut notification = serde_json::json!({
                "jsonrpc": "2.0",
                "method": method,
            });
            if let Some(params) = params {
                notification["params"] = params;
            }
            let line = serde_json::to_string(&notification)?;
            let sender = self.stdin_tx.lock().await.clone();
            let Some(sender) = sender else {
                return Err(TransportError::NotAvailable("stdio transport not open".into()));
            };
            sender
                .send(line)
                .await
                .map_err(|_| TransportError::SendFailed("stdin closed".into()))
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
            *self.stdin_tx.lock().await = None;
            if let Some(mut child) = self.child.lock().await.take() {
                #[cfg(unix)]
                {
                    if let Some(pid) = child.id() {
                        // SIGTERM the whole process group, not just the
                        // immediate child, so grandchildren don't linger.
                        unsafe {
                            libc_kill_group(pid as i32);
                        }
                    }
                }
                #[cfg(windows)]
                {
                    if let Some(pid) = child.id() {
                        let _ = std::process::Command::new("taskkill")
                            .args(["/T", "/F", "/PID", &pid.to_string()])
                            .status();
                    }
                }
                match tokio::time::timeout(std::time::Duration::from_secs(5), child.wait()).await {
                    Ok(Ok(status)) => self.observe_exit(status).await,
                    Ok(Err(e)) => warn!(error = %e, "error waiting for child exit"),
                    Err(_) => {
                        let _ = child.kill().await;
                    }
                }
            }
            *self.state.lock().await = TransportState::Disconnected;
            Ok(())
        })
    }

    fn endpoint(&self) -> Option<String> {
        Some(format!("{} {}", self.config.command, self.config.args.join(" ")))
    }
}

#[cfg(unix)]
/// Best-effort SIGTERM to the child's process group (PID == PGID since we
/// call `process_group(0)` at spawn time).
unsafe fn libc_kill_group(pid: i32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    const SIGTERM: i32 = 15;
    let _ = kill(-pid, SIGTERM);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_class_maps_well_known_codes() {
        let sig = ProcessExitSignal { code: Some(2), port_conflict_detected: false };
        assert_eq!(sig.classify(), ExitClass::PortConflict);
        let sig = ProcessExitSignal { code: Some(3), port_conflict_detected: false };
        assert_eq!(sig.classify(), ExitClass::DbLocked);
        let sig = ProcessExitSignal { code: Some(4), port_conflict_detected: false };
        assert_eq!(sig.classify(), ExitClass::ConfigError);
        let sig = ProcessExitSignal { code: Some(17), port_conflict_detected: false };
        assert_eq!(sig.classify(), ExitClass::GeneralError);
    }

    #[test]
    fn ring_buffer_substring_escalates_regardless_of_code() {
        let sig = ProcessExitSignal { code: Some(1), port_conflict_detected: true };
        assert_eq!(sig.classify(), ExitClass::PortConflict);
    }

    #[tokio::test]
    async fn rejects_empty_command() {
        let t = StdioTransport::new(StdioTransportConfig::default());
        let err = t.open().await.unwrap_err();
        assert!(matches!(err, TransportError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn endpoint_describes_command_line() {
        let t = StdioTransport::new(StdioTransportConfig {
            command: "echo-tool".into(),
            args: vec!["--stdio".into()],
            ..Default::default()
        });
        assert_eq!(t.endpoint().as_deref(), Some("echo-tool --stdio"));
    }
}
