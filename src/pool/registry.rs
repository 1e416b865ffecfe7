//! Capability registry: aggregates capabilities across all connected backends.
//!
//! Provides:
//! - Namespaced names (`backend_capability`) built from backend id and
//!   the backend's own capability name
//! - Resolution of a namespaced name back to `(backend id, original name)`
//! - Structural validation of call arguments against the input schema
//!
//! The registry holds one immutable snapshot. `rebuild` computes a fresh
//! snapshot from the connections and swaps it in whole; readers hold an
//! `Arc` to whichever snapshot was current when they looked.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::connection::BackendConnection;
use super::errors::PoolError;
use super::types::AggregatedCapability;

/// Joins backend id and capability name. Backend ids must not contain it.
pub const NAMESPACE_SEPARATOR: char = '_';

/// Build `<backend_id><separator><capability>`.
pub fn build_namespaced_name(backend_id: &str, capability: &str) -> String {
    format!("{backend_id}{NAMESPACE_SEPARATOR}{capability}")
}

/// Split a namespaced name at the first separator.
///
/// E.g., `"files_read_text"` → `("files", "read_text")`.
pub fn split_namespaced_name(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAMESPACE_SEPARATOR)
}

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// One complete, immutable view of the catalog, keyed by namespaced name.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    entries: BTreeMap<String, AggregatedCapability>,
}

impl RegistrySnapshot {
    pub fn get(&self, namespaced_name: &str) -> Option<&AggregatedCapability> {
        self.entries.get(namespaced_name)
    }

    /// Entries in namespaced-name order.
    pub fn iter(&self) -> impl Iterator<Item = &AggregatedCapability> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── CapabilityRegistry ──────────────────────────────────────────────────────

/// Routing table from namespaced capability names to backends.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard the current snapshot and build a new one from every connected
    /// backend's cached capabilities.
    ///
    /// Backends are visited in ascending id order. When two entries land on
    /// the same namespaced name the later one wins.
    ///
    /// The write lock is held from the first connection read until the new
    /// snapshot is stored, so concurrent rebuilds cannot interleave.
    pub fn rebuild(
        &self,
        connections: &BTreeMap<String, Arc<BackendConnection>>,
    ) -> Arc<RegistrySnapshot> {
        let mut current = self.current.write();
        let mut entries = BTreeMap::new();

        for (backend_id, conn) in connections {
            if !conn.is_connected() {
                continue;
            }
            for capability in conn.capabilities().iter() {
                let namespaced_name = build_namespaced_name(backend_id, &capability.name);
                let entry = AggregatedCapability {
                    namespaced_name: namespaced_name.clone(),
                    backend_id: backend_id.clone(),
                    original_name: capability.name.clone(),
                    capability: capability.clone(),
                };
                if let Some(previous) = entries.insert(namespaced_name, entry) {
                    tracing::warn!(
                        name = %previous.namespaced_name,
                        overwritten = %previous.backend_id,
                        by = %backend_id,
                        "namespaced capability collision, keeping the later entry"
                    );
                }
            }
        }

        let snapshot = Arc::new(RegistrySnapshot { entries });
        *current = Arc::clone(&snapshot);
        drop(current);

        tracing::debug!(capabilities = snapshot.len(), "capability registry rebuilt");
        snapshot
    }

    /// The snapshot currently in effect.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Resolve a namespaced name to `(backend id, original capability name)`.
    pub fn resolve(&self, namespaced_name: &str) -> Result<(String, String), PoolError> {
        self.snapshot()
            .get(namespaced_name)
            .map(|entry| (entry.backend_id.clone(), entry.original_name.clone()))
            .ok_or_else(|| PoolError::UnknownCapability {
                name: namespaced_name.to_string(),
            })
    }

    pub fn get(&self, namespaced_name: &str) -> Option<AggregatedCapability> {
        self.snapshot().get(namespaced_name).cloned()
    }

    pub fn contains(&self, namespaced_name: &str) -> bool {
        self.snapshot().get(namespaced_name).is_some()
    }

    /// Every capability in the catalog.
    pub fn list(&self) -> Vec<AggregatedCapability> {
        self.snapshot().iter().cloned().collect()
    }

    /// Capabilities belonging to one backend.
    pub fn list_for_backend(&self, backend_id: &str) -> Vec<AggregatedCapability> {
        self.snapshot()
            .iter()
            .filter(|entry| entry.backend_id == backend_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Check that `arguments` carries every top-level field the capability's
    /// input schema lists as `required`.
    ///
    /// Full JSON Schema validation is left to the backend.
    pub fn validate_arguments(
        &self,
        namespaced_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<(), PoolError> {
        let entry = self
            .get(namespaced_name)
            .ok_or_else(|| PoolError::UnknownCapability {
                name: namespaced_name.to_string(),
            })?;

        let Some(required) = entry
            .capability
            .input_schema
            .get("required")
            .and_then(|r| r.as_array())
        else {
            return Ok(());
        };

        let args_obj = arguments.as_object();
        for field_name in required.iter().filter_map(|f| f.as_str()) {
            let present = args_obj.is_some_and(|obj| obj.contains_key(field_name));
            if !present {
                return Err(PoolError::InvalidArguments {
                    capability: namespaced_name.to_string(),
                    reason: format!("missing required field: '{field_name}'"),
                });
            }
        }

        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
