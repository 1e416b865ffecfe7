//! Shared types for the backend pool.
//!
//! JSON-RPC 2.0 message types, MCP protocol payloads, and the pool's own
//! value types (definitions, capabilities, caller identity, status).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Protocol revision sent in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// MCP `initialize` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// One page of a `tools/list` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<Capability>,
    #[serde(default, alias = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Backend Definitions ─────────────────────────────────────────────────────

/// How to launch a backend process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the child. Inherits the hub's cwd when unset.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Variables overlaid on the hub's own environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A configured backend. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub launch: LaunchSpec,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Scopes a caller must hold to see or call this backend's capabilities.
    #[serde(default)]
    pub required_scopes: BTreeSet<String>,
}

fn default_enabled() -> bool {
    true
}

impl BackendDefinition {
    /// A minimal enabled definition with no arguments or scope requirements.
    pub fn new(id: &str, command: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            launch: LaunchSpec {
                command: command.to_string(),
                args: Vec::new(),
                cwd: None,
                env: BTreeMap::new(),
            },
            enabled: true,
            required_scopes: BTreeSet::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launch.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.launch.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

// ─── Capabilities ────────────────────────────────────────────────────────────

/// A single invocable operation advertised by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

impl Capability {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }
}

/// A capability as it appears in the aggregated catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedCapability {
    pub namespaced_name: String,
    pub backend_id: String,
    pub original_name: String,
    pub capability: Capability,
}

/// Catalog entry handed to the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityInfo {
    pub namespaced_name: String,
    pub backend_id: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl From<&AggregatedCapability> for CapabilityInfo {
    fn from(agg: &AggregatedCapability) -> Self {
        Self {
            namespaced_name: agg.namespaced_name.clone(),
            backend_id: agg.backend_id.clone(),
            description: agg.capability.description.clone(),
            input_schema: agg.capability.input_schema.clone(),
        }
    }
}

// ─── Caller Identity ─────────────────────────────────────────────────────────

/// The authenticated requester behind a call, as supplied by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub id: String,
    pub scopes: BTreeSet<String>,
}

impl CallerIdentity {
    pub fn new<I, S>(id: &str, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.to_string(),
            scopes: scopes.into_iter().map(Into::into).collect(),
        }
    }

    /// Required scopes this caller does not hold, in sorted order.
    pub fn missing_scopes(&self, required: &BTreeSet<String>) -> Vec<String> {
        required.difference(&self.scopes).cloned().collect()
    }

    pub fn satisfies(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.scopes)
    }
}

// ─── State & Status ──────────────────────────────────────────────────────────

/// Lifecycle state of a single backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of the pool as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Empty,
    Starting,
    Ready,
    Stopping,
}

/// Point-in-time view of one backend, for health and diagnostics surfaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub id: String,
    pub name: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub capability_count: usize,
    pub error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

// ─── Settings ────────────────────────────────────────────────────────────────

/// Default timeout for the initialize handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default grace period between closing stdin and force-killing.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeouts applied by the pool. `call_timeout: None` leaves calls unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub handshake_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub call_timeout: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            call_timeout: None,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
