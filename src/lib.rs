//! toolhub: one namespaced capability catalog over a pool of MCP backends.
//!
//! Backends are local processes speaking JSON-RPC over stdio. The pool
//! starts them in parallel, aggregates their tools under
//! `<backend id>_<tool name>`, filters by caller scopes, and routes calls.

pub mod config;
pub mod logging;
pub mod pool;

pub use config::{load_hub_config, ConfigError, HubConfig};
pub use pool::{CallerIdentity, PoolError, PoolManager};
