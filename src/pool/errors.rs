//! Pool error types.

use thiserror::Error;

/// Coarse classification of a [`PoolError`], for callers that map failures
/// onto their own surface (HTTP status, JSON-RPC code, log level).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A backend could not be established or used while expected to be live.
    Connection,
    /// A connected backend failed to complete a specific invocation.
    Execution,
    /// Unknown backend id or namespaced capability.
    NotFound,
    /// The caller lacks the scopes the backend requires.
    Authorization,
    /// Low-level process or channel fault, not yet attributed to an operation.
    Protocol,
}

/// Errors that can occur while managing backends or routing calls.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Establishing the backend failed at some step (spawn, handshake, listing).
    #[error("backend '{backend}' failed to connect: {source}")]
    Connection {
        backend: String,
        #[source]
        source: Box<PoolError>,
    },

    /// Another connect attempt for the same backend has not settled yet.
    #[error("backend '{backend}' is already connecting")]
    ConnectInProgress { backend: String },

    /// The operation requires a live connection and there is none.
    #[error("backend '{backend}' is not connected")]
    NotConnected { backend: String },

    /// A connected backend failed to complete an invocation.
    #[error("backend '{backend}' failed to execute '{capability}': {source}")]
    Execution {
        backend: String,
        capability: String,
        #[source]
        source: Box<PoolError>,
    },

    /// Arguments failed the structural check against the input schema.
    #[error("invalid arguments for '{capability}': {reason}")]
    InvalidArguments { capability: String, reason: String },

    /// Namespaced capability is absent from the current registry snapshot.
    #[error("unknown capability: '{name}'")]
    UnknownCapability { name: String },

    /// Backend id is not part of the pool.
    #[error("unknown backend: '{id}'")]
    UnknownBackend { id: String },

    /// Caller scopes do not cover the owning backend's required scopes.
    #[error("caller '{caller}' may not call '{capability}' on backend '{backend}': missing scopes {missing:?}")]
    Unauthorized {
        caller: String,
        backend: String,
        capability: String,
        missing: Vec<String>,
    },

    /// The backend process could not be started.
    #[error("failed to spawn backend '{backend}': {reason}")]
    SpawnFailed { backend: String, reason: String },

    /// JSON-RPC communication error (serialization, I/O).
    #[error("transport error for backend '{backend}': {reason}")]
    Transport { backend: String, reason: String },

    /// The backend's channel is gone (stdout closed, stdin broken).
    #[error("backend '{backend}' closed its channel: {reason}")]
    ChannelClosed { backend: String, reason: String },

    /// Backend returned a JSON-RPC error response.
    #[error("backend error [{code}]: {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Backend completed the call but flagged the result with `isError`.
    #[error("tool '{capability}' reported an error: {message}")]
    ToolFailed {
        capability: String,
        message: String,
        result: serde_json::Value,
    },

    /// A handshake, call, or shutdown exceeded its deadline.
    #[error("{operation} on backend '{backend}' timed out after {timeout_ms}ms")]
    Timeout {
        backend: String,
        operation: String,
        timeout_ms: u64,
    },

    /// A response was well-formed JSON-RPC but its payload was not understood.
    #[error("invalid response from backend '{backend}': {reason}")]
    InvalidResponse { backend: String, reason: String },
}

impl PoolError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } | Self::ConnectInProgress { .. } | Self::NotConnected { .. } => {
                ErrorKind::Connection
            }
            Self::Execution { .. } | Self::InvalidArguments { .. } => ErrorKind::Execution,
            Self::UnknownCapability { .. } | Self::UnknownBackend { .. } => ErrorKind::NotFound,
            Self::Unauthorized { .. } => ErrorKind::Authorization,
            Self::SpawnFailed { .. }
            | Self::Transport { .. }
            | Self::ChannelClosed { .. }
            | Self::Server { .. }
            | Self::ToolFailed { .. }
            | Self::Timeout { .. }
            | Self::InvalidResponse { .. } => ErrorKind::Protocol,
        }
    }

    /// Whether the error means the backend process is no longer reachable.
    ///
    /// Looks through `Execution` and `Connection` wrappers.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ChannelClosed { .. } => true,
            Self::Execution { source, .. } | Self::Connection { source, .. } => {
                source.is_disconnect()
            }
            _ => false,
        }
    }

    pub(crate) fn connection(backend: &str, source: PoolError) -> Self {
        Self::Connection {
            backend: backend.to_string(),
            source: Box::new(source),
        }
    }

    pub(crate) fn execution(backend: &str, capability: &str, source: PoolError) -> Self {
        Self::Execution {
            backend: backend.to_string(),
            capability: capability.to_string(),
            source: Box::new(source),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
