//! Hub configuration loading and validation.
//!
//! Reads `toolhub.yaml` (or `.json`) and resolves environment variables.
//! The config is the single source of truth for backend definitions, pool
//! timeouts, and logging.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::logging::LogSettings;
use crate::pool::registry::NAMESPACE_SEPARATOR;
use crate::pool::types::{
    BackendDefinition, PoolSettings, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT,
};

/// Env var pointing at a config file, checked before the upward search.
pub const CONFIG_ENV_VAR: &str = "TOOLHUB_CONFIG";

/// File names searched for, in order.
const CONFIG_FILE_NAMES: [&str; 3] = ["toolhub.yaml", "toolhub.yml", "toolhub.json"];

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },

    #[error("could not find toolhub.yaml or toolhub.json (set TOOLHUB_CONFIG)")]
    NotFound,

    #[error("TOOLHUB_CONFIG points at {path}, which does not exist")]
    EnvPathMissing { path: PathBuf },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Pool timeouts as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SettingsSection {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Per-call deadline. Absent means calls are unbounded.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64
}
fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as u64
}

impl Default for SettingsSection {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            call_timeout_ms: None,
        }
    }
}

/// Top-level hub config (mirrors `toolhub.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub settings: SettingsSection,
    #[serde(default)]
    pub logging: LogSettings,
    #[serde(default)]
    pub backends: Vec<BackendDefinition>,
}

impl HubConfig {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            handshake_timeout: Duration::from_millis(self.settings.handshake_timeout_ms),
            shutdown_timeout: Duration::from_millis(self.settings.shutdown_timeout_ms),
            call_timeout: self.settings.call_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Check ids and commands.
    ///
    /// Ids must be non-empty, unique, and free of the namespace separator so
    /// every namespaced name splits back to exactly one backend.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    reason: "backend id must not be empty".into(),
                });
            }
            if backend.id.contains(NAMESPACE_SEPARATOR) {
                return Err(ConfigError::Invalid {
                    reason: format!(
                        "backend id '{}' must not contain '{NAMESPACE_SEPARATOR}'",
                        backend.id
                    ),
                });
            }
            if !seen.insert(backend.id.as_str()) {
                return Err(ConfigError::Invalid {
                    reason: format!("duplicate backend id '{}'", backend.id),
                });
            }
            if backend.launch.command.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    reason: format!("backend '{}' has an empty command", backend.id),
                });
            }
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the hub config.
///
/// Checks `TOOLHUB_CONFIG` first, then searches upward from `start`. A
/// `TOOLHUB_CONFIG` naming a missing file is an error rather than a fallback.
pub fn find_config_path(start: &Path) -> Result<PathBuf, ConfigError> {
    find_config_path_in(std::env::var(CONFIG_ENV_VAR).ok(), start)
}

fn find_config_path_in(env_path: Option<String>, start: &Path) -> Result<PathBuf, ConfigError> {
    // 1. Check env var
    if let Some(path) = env_path {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        return Err(ConfigError::EnvPathMissing { path: candidate });
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        for name in CONFIG_FILE_NAMES {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        if !dir.pop() {
            break;
        }
    }

    Err(ConfigError::NotFound)
}

/// Load, interpolate, parse and validate the hub config.
///
/// JSON is used for `.json` files, YAML for everything else. Relative
/// backend working directories are resolved against the config file's
/// directory.
pub fn load_hub_config(path: &Path) -> Result<HubConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let interpolated = interpolate_env_vars(&raw);

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let mut config: HubConfig = if is_json {
        serde_json::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    };

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    for backend in &mut config.backends {
        if backend.name.is_empty() {
            backend.name = backend.id.clone();
        }
        if let Some(cwd) = backend.launch.cwd.as_mut() {
            let expanded = PathBuf::from(expand_tilde(cwd));
            if expanded.is_relative() {
                *cwd = base_dir.join(expanded).display().to_string();
            } else {
                *cwd = expanded.display().to_string();
            }
        }
    }

    config.validate()?;

    tracing::debug!(
        path = %path.display(),
        backends = config.backends.len(),
        "hub config loaded"
    );
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
