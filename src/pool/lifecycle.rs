//! Backend process lifecycle.
//!
//! [`Launcher`] and [`BackendSession`] are the seam between the pool and a
//! concrete backend: a launcher turns a [`BackendDefinition`] into a live,
//! handshaken session; a session lists capabilities, calls them, and closes.
//!
//! [`StdioLauncher`] is the production implementation. Each backend runs as a
//! separate OS process speaking JSON-RPC over stdio.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::errors::PoolError;
use super::transport::{extract_result, StdioTransport};
use super::types::{
    BackendDefinition, Capability, InitializeResult, PoolSettings, ToolsListResult,
    PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Upper bound on `tools/list` pages followed per refresh.
const MAX_LIST_PAGES: usize = 64;

/// How much stderr to attach to a failed handshake.
const STDERR_CAPTURE_LIMIT: usize = 2000;

// ─── Traits ──────────────────────────────────────────────────────────────────

/// A live, handshaken channel to one backend.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Fetch the backend's current capability list.
    async fn list_capabilities(&self) -> Result<Vec<Capability>, PoolError>;

    /// Invoke a capability by its original (un-namespaced) name.
    async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, PoolError>;

    /// Close the channel and terminate the backend. Safe to call twice.
    async fn close(&self) -> Result<(), PoolError>;
}

/// Starts backends.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Spawn the backend, establish its channel, and perform the handshake.
    async fn launch(
        &self,
        definition: &BackendDefinition,
    ) -> Result<Arc<dyn BackendSession>, PoolError>;
}

// ─── StdioLauncher ───────────────────────────────────────────────────────────

/// Launches backends as child processes talking JSON-RPC over stdio.
#[derive(Debug, Clone, Default)]
pub struct StdioLauncher {
    settings: PoolSettings,
}

impl StdioLauncher {
    pub fn new(settings: PoolSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Launcher for StdioLauncher {
    async fn launch(
        &self,
        definition: &BackendDefinition,
    ) -> Result<Arc<dyn BackendSession>, PoolError> {
        let session = spawn_backend(definition, &self.settings).await?;
        Ok(Arc::new(session))
    }
}

/// Build the child command. The child inherits the hub's environment and the
/// definition's variables are overlaid on top.
fn build_command(definition: &BackendDefinition) -> Command {
    let launch = &definition.launch;
    let mut cmd = Command::new(&launch.command);
    cmd.args(&launch.args);

    for (key, value) in &launch.env {
        cmd.env(key, value);
    }

    if let Some(dir) = launch.cwd.as_deref() {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

/// Spawn one backend process and perform the initialization handshake.
pub async fn spawn_backend(
    definition: &BackendDefinition,
    settings: &PoolSettings,
) -> Result<StdioSession, PoolError> {
    let id = definition.id.as_str();

    let mut child = build_command(definition)
        .spawn()
        .map_err(|e| PoolError::SpawnFailed {
            backend: id.to_string(),
            reason: format!("{}: {e}", definition.launch.command),
        })?;

    let stdin = child.stdin.take().ok_or(PoolError::SpawnFailed {
        backend: id.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(PoolError::SpawnFailed {
        backend: id.to_string(),
        reason: "failed to capture stdout".into(),
    })?;
    let stderr_handle = child.stderr.take();

    let transport = StdioTransport::new(id, stdin, stdout);

    match tokio::time::timeout(settings.handshake_timeout, initialize(&transport, definition)).await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let _ = child.kill().await;
            let stderr_ctx = read_stderr_on_failure(stderr_handle).await;
            return Err(with_stderr(e, id, &stderr_ctx));
        }
        Err(_) => {
            let _ = child.kill().await;
            let stderr_ctx = read_stderr_on_failure(stderr_handle).await;
            let timeout = PoolError::Timeout {
                backend: id.to_string(),
                operation: "initialize".into(),
                timeout_ms: duration_ms(settings.handshake_timeout),
            };
            return Err(with_stderr(timeout, id, &stderr_ctx));
        }
    }

    let stderr_task = stderr_handle.map(|stderr| drain_stderr(id.to_string(), stderr));

    tracing::info!(
        backend = %id,
        pid = child.id().unwrap_or_default(),
        "backend process started"
    );

    Ok(StdioSession {
        backend_id: id.to_string(),
        process: Mutex::new(Some(child)),
        transport,
        stderr_task: parking_lot::Mutex::new(stderr_task),
        shutdown_timeout: settings.shutdown_timeout,
    })
}

/// Perform the MCP initialization handshake.
async fn initialize(
    transport: &StdioTransport,
    definition: &BackendDefinition,
) -> Result<(), PoolError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });

    let response = transport.request("initialize", Some(params)).await?;
    let result = extract_result(response)?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| PoolError::InvalidResponse {
            backend: definition.id.clone(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    tracing::debug!(
        backend = %definition.id,
        protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
        server = init
            .server_info
            .as_ref()
            .and_then(|s| s.name.as_deref())
            .unwrap_or("unknown"),
        "handshake complete"
    );

    transport.notify("notifications/initialized", None).await
}

/// Read whatever stderr a failed process left behind.
///
/// Uses a short timeout so an empty or still-open stderr never blocks.
async fn read_stderr_on_failure(stderr_handle: Option<ChildStderr>) -> String {
    let Some(mut stderr) = stderr_handle else {
        return String::new();
    };

    let mut buf = String::new();
    match tokio::time::timeout(Duration::from_millis(500), stderr.read_to_string(&mut buf)).await {
        Ok(Ok(_)) => {
            if buf.len() > STDERR_CAPTURE_LIMIT {
                let mut cut = STDERR_CAPTURE_LIMIT;
                while !buf.is_char_boundary(cut) {
                    cut -= 1;
                }
                buf.truncate(cut);
                buf.push_str("...(truncated)");
            }
            buf
        }
        _ => String::new(),
    }
}

/// Attach captured stderr to a handshake failure, keeping the variant.
fn with_stderr(err: PoolError, backend: &str, stderr: &str) -> PoolError {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        return err;
    }
    tracing::warn!(backend, stderr = %stderr, "backend stderr captured on failure");
    match err {
        PoolError::ChannelClosed { backend, reason } => PoolError::ChannelClosed {
            backend,
            reason: format!("{reason} | stderr: {stderr}"),
        },
        PoolError::InvalidResponse { backend, reason } => PoolError::InvalidResponse {
            backend,
            reason: format!("{reason} | stderr: {stderr}"),
        },
        PoolError::Timeout {
            backend,
            operation,
            timeout_ms,
        } => PoolError::Timeout {
            backend,
            operation: format!("{operation} (stderr: {stderr})"),
            timeout_ms,
        },
        PoolError::Server {
            code,
            message,
            data,
        } => PoolError::Server {
            code,
            message: format!("{message} | stderr: {stderr}"),
            data,
        },
        other => other,
    }
}

/// Forward a running backend's stderr into the log.
///
/// Reads raw lines so non-UTF-8 output never ends the drain; the pipe stays
/// open until EOF or a read error.
fn drain_stderr<R>(backend: String, stderr: R) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    tracing::debug!(backend = %backend, "stderr: {}", line.trim_end());
                }
                Err(e) => {
                    tracing::debug!(backend = %backend, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    })
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ─── StdioSession ────────────────────────────────────────────────────────────

/// A running backend process with its transport.
pub struct StdioSession {
    backend_id: String,
    /// `None` once the process has been reaped.
    process: Mutex<Option<Child>>,
    transport: StdioTransport,
    stderr_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

#[async_trait]
impl BackendSession for StdioSession {
    async fn list_capabilities(&self) -> Result<Vec<Capability>, PoolError> {
        let mut capabilities = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let response = self.transport.request("tools/list", params).await?;
            let result = extract_result(response)?;

            let page: ToolsListResult =
                serde_json::from_value(result).map_err(|e| PoolError::InvalidResponse {
                    backend: self.backend_id.clone(),
                    reason: format!("failed to parse tools/list response: {e}"),
                })?;

            capabilities.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(capabilities),
            }
        }

        tracing::warn!(
            backend = %self.backend_id,
            pages = MAX_LIST_PAGES,
            "tools/list pagination limit reached, using partial list"
        );
        Ok(capabilities)
    }

    async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, PoolError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let response = self.transport.request("tools/call", Some(params)).await?;
        let result = extract_result(response)?;

        if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
            return Err(PoolError::ToolFailed {
                capability: name.to_string(),
                message: tool_error_text(&result),
                result,
            });
        }

        Ok(result)
    }

    async fn close(&self) -> Result<(), PoolError> {
        if let Some(task) = self.stderr_task.lock().take() {
            task.abort();
        }

        let Some(mut child) = self.process.lock().await.take() else {
            return Ok(());
        };

        // EOF on stdin is the stdio transport's shutdown signal.
        self.transport.close_input().await;

        match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(backend = %self.backend_id, %status, "backend exited");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                Err(PoolError::Transport {
                    backend: self.backend_id.clone(),
                    reason: format!("failed to wait for exit: {e}"),
                })
            }
            Err(_) => {
                tracing::warn!(
                    backend = %self.backend_id,
                    timeout_ms = duration_ms(self.shutdown_timeout),
                    "backend did not exit in time, killing"
                );
                child.kill().await.map_err(|e| PoolError::Transport {
                    backend: self.backend_id.clone(),
                    reason: format!("failed to kill process: {e}"),
                })
            }
        }
    }
}

/// Join the text blocks of an `isError` tool result.
fn tool_error_text(result: &serde_json::Value) -> String {
    let text: Vec<&str> = result
        .get("content")
        .and_then(|c| c.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect()
        })
        .unwrap_or_default();

    if text.is_empty() {
        "tool returned isError without text content".to_string()
    } else {
        text.join("\n")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
