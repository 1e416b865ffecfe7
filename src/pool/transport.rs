//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with backend child processes:
//! - Writing JSON-RPC requests and notifications to stdin
//! - Reading JSON-RPC responses from stdout
//! - Line-delimited JSON protocol (one JSON object per line)
//!
//! One round trip is in flight per transport at a time: a request holds the
//! reader for its whole duration, so concurrent callers queue on the channel.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::errors::PoolError;
use super::types::{error_codes, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    backend_id: String,
    /// `None` once the input side has been closed.
    writer: Mutex<Option<BoxedWriter>>,
    reader: Mutex<BoxedReader>,
}

impl StdioTransport {
    /// Create a new transport from a child's stdin and stdout.
    pub fn new<W, R>(backend_id: &str, stdin: W, stdout: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
    {
        Self {
            backend_id: backend_id.to_string(),
            writer: Mutex::new(Some(Box::new(stdin))),
            reader: Mutex::new(Box::new(BufReader::new(stdout))),
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// Lines that are not JSON-RPC responses (server log output, stray
    /// notifications) and responses for other ids are skipped.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, PoolError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let mut reader = self.reader.lock().await;
        self.write_message(&req).await?;

        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read =
                reader
                    .read_line(&mut line_buf)
                    .await
                    .map_err(|e| PoolError::Transport {
                        backend: self.backend_id.clone(),
                        reason: format!("failed to read from stdout: {e}"),
                    })?;

            if bytes_read == 0 {
                return Err(PoolError::ChannelClosed {
                    backend: self.backend_id.clone(),
                    reason: "stdout closed (process may have exited)".into(),
                });
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == id => return Ok(resp),
                Ok(resp) => {
                    tracing::debug!(
                        backend = %self.backend_id,
                        expected = id,
                        got = resp.id,
                        "skipping response for another request"
                    );
                }
                Err(_) => {
                    tracing::trace!(
                        backend = %self.backend_id,
                        line = trimmed,
                        "skipping non-response line"
                    );
                }
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), PoolError> {
        self.write_message(&JsonRpcNotification::new(method, params))
            .await
    }

    /// Close the input side so the backend sees EOF on stdin.
    ///
    /// Returns `false` if it was already closed.
    pub async fn close_input(&self) -> bool {
        let mut writer = self.writer.lock().await;
        match writer.take() {
            Some(mut w) => {
                let _ = w.shutdown().await;
                true
            }
            None => false,
        }
    }

    async fn write_message<T: Serialize>(&self, message: &T) -> Result<(), PoolError> {
        let mut json = serde_json::to_string(message).map_err(|e| PoolError::Transport {
            backend: self.backend_id.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| PoolError::ChannelClosed {
            backend: self.backend_id.clone(),
            reason: "stdin already closed".into(),
        })?;

        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| PoolError::ChannelClosed {
                backend: self.backend_id.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer.flush().await.map_err(|e| PoolError::ChannelClosed {
            backend: self.backend_id.clone(),
            reason: format!("failed to flush stdin: {e}"),
        })?;

        Ok(())
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `PoolError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, PoolError> {
    if let Some(err) = response.error {
        return Err(PoolError::Server {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(PoolError::Server {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
