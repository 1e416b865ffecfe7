//! Backend pool: JSON-RPC over stdio management of capability backends.
//!
//! This module handles:
//! - Spawning backend child processes and the MCP handshake
//! - JSON-RPC 2.0 communication over process stdio
//! - Capability discovery and aggregation under namespaced names
//! - Caller scope filtering and call dispatch
//! - Pool lifecycle (parallel start, restart, graceful shutdown)

pub mod connection;
pub mod errors;
pub mod lifecycle;
pub mod manager;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use connection::BackendConnection;
pub use errors::{ErrorKind, PoolError};
pub use lifecycle::{BackendSession, Launcher, StdioLauncher};
pub use manager::{PoolManager, StartReport};
pub use registry::{build_namespaced_name, split_namespaced_name, CapabilityRegistry};
pub use types::{
    BackendDefinition, BackendStatus, CallerIdentity, Capability, CapabilityInfo,
    ConnectionState, PoolSettings, PoolState,
};
