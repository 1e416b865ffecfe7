//! Pool manager: the primary API used by the hub's outer surfaces.
//!
//! Orchestrates backend lifecycle, the capability registry, permission
//! filtering, and call dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tracing::Instrument;

use super::connection::BackendConnection;
use super::errors::PoolError;
use super::lifecycle::{Launcher, StdioLauncher};
use super::registry::CapabilityRegistry;
use super::types::{
    BackendDefinition, BackendStatus, CallerIdentity, CapabilityInfo, PoolSettings, PoolState,
};

// ─── StartReport ─────────────────────────────────────────────────────────────

/// Outcome of [`PoolManager::start_all`]. Partial startup is not an error.
#[derive(Debug, Default)]
pub struct StartReport {
    /// Backends that connected, in id order.
    pub connected: Vec<String>,
    /// Backends that failed, with the connect error.
    pub failed: Vec<(String, PoolError)>,
}

impl StartReport {
    pub fn all_connected(&self) -> bool {
        self.failed.is_empty()
    }
}

// ─── PoolManager ─────────────────────────────────────────────────────────────

/// Owns every backend connection and routes calls to them.
pub struct PoolManager {
    definitions: Vec<BackendDefinition>,
    launcher: Arc<dyn Launcher>,
    settings: PoolSettings,
    connections: RwLock<BTreeMap<String, Arc<BackendConnection>>>,
    registry: CapabilityRegistry,
    state: RwLock<PoolState>,
    /// Serializes start, stop, restart and disconnect against each other.
    lifecycle: tokio::sync::Mutex<()>,
    /// Held across reading the connections and storing the new snapshot.
    rebuild: Mutex<()>,
}

impl PoolManager {
    /// Create a pool that launches backends as child processes.
    pub fn new(definitions: Vec<BackendDefinition>, settings: PoolSettings) -> Self {
        let launcher = Arc::new(StdioLauncher::new(settings));
        Self::with_launcher(definitions, launcher, settings)
    }

    pub fn with_launcher(
        definitions: Vec<BackendDefinition>,
        launcher: Arc<dyn Launcher>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            definitions,
            launcher,
            settings,
            connections: RwLock::new(BTreeMap::new()),
            registry: CapabilityRegistry::new(),
            state: RwLock::new(PoolState::Empty),
            lifecycle: tokio::sync::Mutex::new(()),
            rebuild: Mutex::new(()),
        }
    }

    pub fn state(&self) -> PoolState {
        *self.state.read()
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Ids of every backend in the pool, connected or not.
    pub fn backend_ids(&self) -> Vec<String> {
        self.connections.read().keys().cloned().collect()
    }

    /// Number of namespaced capabilities currently routable.
    pub fn capability_count(&self) -> usize {
        self.registry.len()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect every enabled backend concurrently and build the registry.
    ///
    /// Individual failures never abort the others; failed backends stay in
    /// the pool as `disconnected` with their error recorded.
    ///
    /// Enabled definitions sharing an id collapse into one connection built
    /// from the last of them, so the pool holds one entry per distinct id.
    /// Config loading rejects duplicate ids before they get here.
    pub async fn start_all(&self) -> StartReport {
        let _guard = self.lifecycle.lock().await;

        if self.state() != PoolState::Empty {
            tracing::warn!(state = ?self.state(), "start_all called on a non-empty pool, ignoring");
            return StartReport::default();
        }
        *self.state.write() = PoolState::Starting;

        let mut fresh = BTreeMap::new();
        for definition in self.definitions.iter().filter(|d| d.enabled) {
            let conn = Arc::new(self.new_connection(definition.clone()));
            if fresh.insert(definition.id.clone(), conn).is_some() {
                tracing::warn!(backend = %definition.id, "duplicate backend id, keeping the later definition");
            }
        }
        let conns: Vec<Arc<BackendConnection>> = fresh.values().cloned().collect();
        *self.connections.write() = fresh;

        tracing::info!(backends = conns.len(), "starting backend pool");

        let outcomes = join_all(conns.iter().map(|conn| conn.connect())).await;

        let mut report = StartReport::default();
        for (conn, outcome) in conns.iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.connected.push(conn.id().to_string()),
                Err(e) => report.failed.push((conn.id().to_string(), e)),
            }
        }

        self.rebuild_registry();
        *self.state.write() = PoolState::Ready;

        tracing::info!(
            connected = report.connected.len(),
            failed = report.failed.len(),
            capabilities = self.registry.len(),
            "backend pool ready"
        );
        report
    }

    /// Disconnect every backend concurrently and empty the pool.
    ///
    /// Best-effort: teardown errors are logged by each connection.
    pub async fn stop_all(&self) {
        let _guard = self.lifecycle.lock().await;

        if self.state() == PoolState::Empty {
            return;
        }
        *self.state.write() = PoolState::Stopping;

        let conns: Vec<Arc<BackendConnection>> = self.connections.read().values().cloned().collect();
        tracing::info!(backends = conns.len(), "stopping backend pool");

        join_all(conns.iter().map(|conn| conn.disconnect())).await;

        self.connections.write().clear();
        self.rebuild_registry();
        *self.state.write() = PoolState::Empty;

        tracing::info!("backend pool stopped");
    }

    /// Replace one backend's connection with a fresh one and connect it.
    pub async fn restart_backend(&self, backend_id: &str) -> Result<(), PoolError> {
        let _guard = self.lifecycle.lock().await;

        let definition = self.enabled_definition(backend_id)?.clone();
        let old = self.connection(backend_id)?;

        tracing::info!(backend = %backend_id, "restarting backend");
        old.disconnect().await;

        let conn = Arc::new(self.new_connection(definition));
        self.connections
            .write()
            .insert(backend_id.to_string(), Arc::clone(&conn));

        let outcome = conn.connect().await;
        self.rebuild_registry();
        outcome
    }

    /// Disconnect one backend and drop its capabilities from the registry.
    /// The backend stays in the pool so it can be restarted.
    pub async fn disconnect_backend(&self, backend_id: &str) -> Result<(), PoolError> {
        let _guard = self.lifecycle.lock().await;

        let conn = self.connection(backend_id)?;
        conn.disconnect().await;
        self.rebuild_registry();
        Ok(())
    }

    /// Re-query one backend's capability list and rebuild the registry.
    pub async fn refresh_backend(&self, backend_id: &str) -> Result<(), PoolError> {
        let conn = self.connection(backend_id)?;
        let outcome = self.refresh_connection(&conn).await;
        self.rebuild_registry();
        outcome
    }

    /// Re-query every connected backend concurrently and rebuild once.
    ///
    /// Returns the backends whose refresh failed.
    pub async fn refresh_all(&self) -> Vec<(String, PoolError)> {
        let conns: Vec<Arc<BackendConnection>> = self
            .connections
            .read()
            .values()
            .filter(|c| c.is_connected())
            .cloned()
            .collect();

        let outcomes = join_all(conns.iter().map(|conn| self.refresh_connection(conn))).await;
        self.rebuild_registry();

        conns
            .iter()
            .zip(outcomes)
            .filter_map(|(conn, outcome)| outcome.err().map(|e| (conn.id().to_string(), e)))
            .collect()
    }

    // ─── Discovery ───────────────────────────────────────────────────────

    /// The capabilities a caller may see.
    ///
    /// Without a caller the full catalog is returned. With one, capabilities
    /// whose backend requires scopes the caller lacks are left out.
    pub fn get_capabilities_for(&self, caller: Option<&CallerIdentity>) -> Vec<CapabilityInfo> {
        let snapshot = self.registry.snapshot();
        snapshot
            .iter()
            .filter(|entry| match caller {
                None => true,
                Some(caller) => self
                    .enabled_definition(&entry.backend_id)
                    .is_ok_and(|def| caller.satisfies(&def.required_scopes)),
            })
            .map(CapabilityInfo::from)
            .collect()
    }

    // ─── Dispatch ────────────────────────────────────────────────────────

    /// Route one call to the backend owning `namespaced_name`.
    ///
    /// Steps:
    /// 1. Resolve the namespaced name against the current registry
    /// 2. Check the caller's scopes against the backend's required scopes
    /// 3. Check required argument fields
    /// 4. Forward to the backend and return its raw result
    ///
    /// Never retried. Steps 1 through 3 fail without contacting a backend.
    pub async fn dispatch(
        &self,
        namespaced_name: &str,
        arguments: serde_json::Value,
        caller: Option<&CallerIdentity>,
    ) -> Result<serde_json::Value, PoolError> {
        let span = tracing::info_span!(
            "dispatch",
            call_id = %uuid::Uuid::new_v4(),
            capability = %namespaced_name,
            caller = caller.map(|c| c.id.as_str()).unwrap_or("-"),
        );
        self.dispatch_inner(namespaced_name, arguments, caller)
            .instrument(span)
            .await
    }

    async fn dispatch_inner(
        &self,
        namespaced_name: &str,
        arguments: serde_json::Value,
        caller: Option<&CallerIdentity>,
    ) -> Result<serde_json::Value, PoolError> {
        let start = Instant::now();

        let (backend_id, original_name) = self.registry.resolve(namespaced_name)?;

        if let Some(caller) = caller {
            let definition = self.enabled_definition(&backend_id)?;
            let missing = caller.missing_scopes(&definition.required_scopes);
            if !missing.is_empty() {
                tracing::warn!(backend = %backend_id, missing = ?missing, "call denied");
                return Err(PoolError::Unauthorized {
                    caller: caller.id.clone(),
                    backend: backend_id,
                    capability: namespaced_name.to_string(),
                    missing,
                });
            }
        }

        self.registry.validate_arguments(namespaced_name, &arguments)?;

        let conn = self.connection(&backend_id)?;
        let outcome = conn.invoke(&original_name, arguments).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &outcome {
            Ok(_) => tracing::debug!(backend = %backend_id, duration_ms, "call completed"),
            Err(e) => {
                tracing::warn!(backend = %backend_id, duration_ms, error = %e, "call failed");
                if e.is_disconnect() {
                    self.rebuild_registry();
                }
            }
        }
        outcome
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Per-backend status, ordered by id.
    pub fn status(&self) -> Vec<BackendStatus> {
        self.connections
            .read()
            .values()
            .map(|conn| conn.status())
            .collect()
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn new_connection(&self, definition: BackendDefinition) -> BackendConnection {
        BackendConnection::new(
            definition,
            Arc::clone(&self.launcher),
            self.settings.call_timeout,
        )
    }

    fn enabled_definition(&self, backend_id: &str) -> Result<&BackendDefinition, PoolError> {
        self.definitions
            .iter()
            .rev()
            .find(|d| d.enabled && d.id == backend_id)
            .ok_or_else(|| PoolError::UnknownBackend {
                id: backend_id.to_string(),
            })
    }

    fn connection(&self, backend_id: &str) -> Result<Arc<BackendConnection>, PoolError> {
        if let Some(conn) = self.connections.read().get(backend_id) {
            return Ok(Arc::clone(conn));
        }
        // Known but not started yet.
        self.enabled_definition(backend_id)?;
        Err(PoolError::NotConnected {
            backend: backend_id.to_string(),
        })
    }

    async fn refresh_connection(&self, conn: &BackendConnection) -> Result<(), PoolError> {
        let outcome = conn.refresh_capabilities().await;
        if let Err(e) = &outcome {
            tracing::warn!(backend = %conn.id(), error = %e, "capability refresh failed");
            if e.is_disconnect() {
                conn.disconnect().await;
            }
        }
        outcome
    }

    /// Recompute the registry from the current connection set.
    ///
    /// Rebuilds run one at a time and each one reads the map only after the
    /// previous one stored its snapshot, so the last snapshot stored always
    /// reflects the latest connection states.
    fn rebuild_registry(&self) {
        let _guard = self.rebuild.lock();
        let conns = self.connections.read().clone();
        self.registry.rebuild(&conns);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pool::errors::ErrorKind;
    use crate::pool::testing::{FakeBackend, FakeLauncher};
    use crate::pool::types::{Capability, ConnectionState};

    fn pool(launcher: &Arc<FakeLauncher>, definitions: Vec<BackendDefinition>) -> PoolManager {
        PoolManager::with_launcher(
            definitions,
            Arc::clone(launcher) as Arc<dyn Launcher>,
            PoolSettings::default(),
        )
    }

    fn two_backends() -> (Arc<FakeLauncher>, FakeBackend, FakeBackend) {
        let launcher = Arc::new(FakeLauncher::new());
        let a = FakeBackend::new("a").with_tools(["ping"]);
        let b = FakeBackend::new("b").with_tools(["ping"]);
        launcher.add(a.clone());
        launcher.add(b.clone());
        (launcher, a, b)
    }

    fn text_of(result: &serde_json::Value) -> &str {
        result["content"][0]["text"].as_str().unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_routing() {
        let (launcher, a, b) = two_backends();
        let manager = pool(
            &launcher,
            vec![BackendDefinition::new("a", "fake"), BackendDefinition::new("b", "fake")],
        );

        let report = manager.start_all().await;
        assert!(report.all_connected());
        assert_eq!(manager.state(), PoolState::Ready);

        let names: Vec<String> = manager
            .get_capabilities_for(None)
            .into_iter()
            .map(|c| c.namespaced_name)
            .collect();
        assert_eq!(names, vec!["a_ping", "b_ping"]);

        let result = manager
            .dispatch("b_ping", serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(text_of(&result), "b:ping");
        assert!(a.calls().is_empty());
        assert_eq!(b.calls().len(), 1);
        assert_eq!(b.calls()[0].0, "ping");
    }

    #[tokio::test]
    async fn test_status_covers_every_enabled_definition() {
        let (launcher, _a, _b) = two_backends();
        let manager = pool(
            &launcher,
            vec![
                BackendDefinition::new("a", "fake"),
                BackendDefinition::new("b", "fake"),
                BackendDefinition::new("c", "fake").disabled(),
                BackendDefinition::new("missing", "/nonexistent/binary"),
            ],
        );

        let report = manager.start_all().await;
        assert_eq!(report.connected, vec!["a", "b"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "missing");

        let status = manager.status();
        assert_eq!(status.len(), 3);
        let ids: Vec<&str> = status.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "missing"]);

        let missing = &status[2];
        assert!(!missing.connected);
        assert_eq!(missing.state, ConnectionState::Disconnected);
        assert!(missing.error.is_some());
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_healthy_backends_routable() {
        let (launcher, _a, _b) = two_backends();
        let manager = pool(
            &launcher,
            vec![
                BackendDefinition::new("a", "fake"),
                BackendDefinition::new("broken", "/nonexistent/binary"),
            ],
        );
        manager.start_all().await;

        assert_eq!(manager.capability_count(), 1);
        assert!(manager.registry().list_for_backend("broken").is_empty());
        let result = manager
            .dispatch("a_ping", serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(text_of(&result), "a:ping");
    }

    #[tokio::test]
    async fn test_start_all_twice_is_noop() {
        let (launcher, _a, _b) = two_backends();
        let manager = pool(&launcher, vec![BackendDefinition::new("a", "fake")]);

        manager.start_all().await;
        let second = manager.start_all().await;
        assert!(second.connected.is_empty());
        assert_eq!(launcher.launch_count("a"), 1);
    }

    #[tokio::test]
    async fn test_unknown_capability_never_reaches_backend() {
        let (launcher, a, b) = two_backends();
        let manager = pool(
            &launcher,
            vec![BackendDefinition::new("a", "fake"), BackendDefinition::new("b", "fake")],
        );
        manager.start_all().await;

        let err = manager
            .dispatch("nonexistent_tool", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::UnknownCapability { .. }));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(a.calls().is_empty());
        assert!(b.calls().is_empty());
    }

    #[tokio::test]
    async fn test_scope_filtering_and_authorization() {
        let (launcher, a, b) = two_backends();
        let manager = pool(
            &launcher,
            vec![
                BackendDefinition::new("a", "fake").with_scopes(["read"]),
                BackendDefinition::new("b", "fake").with_scopes(["read", "execute"]),
            ],
        );
        manager.start_all().await;

        let reader = CallerIdentity::new("reader", ["read"]);
        let visible: Vec<String> = manager
            .get_capabilities_for(Some(&reader))
            .into_iter()
            .map(|c| c.namespaced_name)
            .collect();
        assert_eq!(visible, vec!["a_ping"]);

        let err = manager
            .dispatch("b_ping", serde_json::json!({}), Some(&reader))
            .await
            .unwrap_err();
        match &err {
            PoolError::Unauthorized { caller, missing, .. } => {
                assert_eq!(caller, "reader");
                assert_eq!(missing, &vec!["execute".to_string()]);
            }
            other => panic!("expected Unauthorized, got {other:?}"),
        }
        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert!(b.calls().is_empty());

        manager
            .dispatch("a_ping", serde_json::json!({}), Some(&reader))
            .await
            .unwrap();
        assert_eq!(a.calls().len(), 1);

        let admin = CallerIdentity::new("admin", ["read", "execute"]);
        assert_eq!(manager.get_capabilities_for(Some(&admin)).len(), 2);
        manager
            .dispatch("b_ping", serde_json::json!({}), Some(&admin))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_required_argument_never_reaches_backend() {
        let launcher = Arc::new(FakeLauncher::new());
        let mut cap = Capability::new("read", "Read a file");
        cap.input_schema = serde_json::json!({
            "type": "object",
            "required": ["path"]
        });
        let fs = FakeBackend::new("fs").with_capability(cap);
        launcher.add(fs.clone());
        let manager = pool(&launcher, vec![BackendDefinition::new("fs", "fake")]);
        manager.start_all().await;

        let err = manager
            .dispatch("fs_read", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::InvalidArguments { .. }));
        assert!(fs.calls().is_empty());

        manager
            .dispatch("fs_read", serde_json::json!({"path": "/tmp/x"}), None)
            .await
            .unwrap();
        assert_eq!(fs.calls()[0].1["path"], "/tmp/x");
    }

    #[tokio::test]
    async fn test_backend_failure_carries_context() {
        let (launcher, _a, _b) = two_backends();
        let manager = pool(&launcher, vec![BackendDefinition::new("a", "fake")]);
        manager.start_all().await;

        let err = {
            let conn = manager.connection("a").unwrap();
            conn.invoke("pong", serde_json::json!({})).await.unwrap_err()
        };
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(err.to_string().contains("'a'"));
        assert!(err.to_string().contains("pong"));
    }

    #[tokio::test]
    async fn test_disconnect_during_dispatch_drops_capabilities() {
        let (launcher, a, _b) = two_backends();
        let manager = pool(
            &launcher,
            vec![BackendDefinition::new("a", "fake"), BackendDefinition::new("b", "fake")],
        );
        manager.start_all().await;

        a.crash();
        let err = manager
            .dispatch("a_ping", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
        assert!(!manager.registry().contains("a_ping"));
        assert!(manager.registry().contains("b_ping"));

        let err = manager
            .dispatch("a_ping", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::UnknownCapability { .. }));
    }

    #[tokio::test]
    async fn test_restart_backend_reconnects() {
        let (launcher, a, _b) = two_backends();
        let manager = pool(&launcher, vec![BackendDefinition::new("a", "fake")]);
        manager.start_all().await;

        a.crash();
        let _ = manager.dispatch("a_ping", serde_json::json!({}), None).await;
        assert_eq!(manager.capability_count(), 0);

        a.recover();
        manager.restart_backend("a").await.unwrap();
        assert_eq!(launcher.launch_count("a"), 2);
        assert!(manager.registry().contains("a_ping"));
        manager
            .dispatch("a_ping", serde_json::json!({}), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_restart_unknown_backend() {
        let (launcher, _a, _b) = two_backends();
        let manager = pool(&launcher, vec![BackendDefinition::new("a", "fake")]);
        manager.start_all().await;

        let err = manager.restart_backend("zzz").await.unwrap_err();
        assert!(matches!(err, PoolError::UnknownBackend { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_backend_is_idempotent() {
        let (launcher, a, _b) = two_backends();
        let manager = pool(
            &launcher,
            vec![BackendDefinition::new("a", "fake"), BackendDefinition::new("b", "fake")],
        );
        manager.start_all().await;

        manager.disconnect_backend("a").await.unwrap();
        manager.disconnect_backend("a").await.unwrap();
        assert_eq!(a.close_count(), 1);
        assert_eq!(manager.status().len(), 2);
        assert!(!manager.status()[0].connected);
        assert_eq!(
            manager.registry().list().len(),
            1,
            "only b's capabilities remain"
        );
    }

    #[tokio::test]
    async fn test_refresh_backend_picks_up_new_tools() {
        let (launcher, a, _b) = two_backends();
        let manager = pool(&launcher, vec![BackendDefinition::new("a", "fake")]);
        manager.start_all().await;

        a.set_tools(["ping", "echo"]);
        assert!(!manager.registry().contains("a_echo"));
        manager.refresh_backend("a").await.unwrap();
        assert!(manager.registry().contains("a_echo"));
        assert_eq!(manager.capability_count(), 2);
    }

    #[tokio::test]
    async fn test_refresh_all_reports_failures() {
        let (launcher, a, b) = two_backends();
        let manager = pool(
            &launcher,
            vec![BackendDefinition::new("a", "fake"), BackendDefinition::new("b", "fake")],
        );
        manager.start_all().await;

        a.set_list_failure(true);
        b.set_tools(["ping", "pong"]);
        let failures = manager.refresh_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "a");
        // a keeps its previous list.
        assert!(manager.registry().contains("a_ping"));
        assert!(manager.registry().contains("b_pong"));
    }

    #[tokio::test]
    async fn test_stop_all_empties_pool() {
        let (launcher, a, b) = two_backends();
        let manager = pool(
            &launcher,
            vec![BackendDefinition::new("a", "fake"), BackendDefinition::new("b", "fake")],
        );
        manager.start_all().await;
        manager.stop_all().await;

        assert_eq!(manager.state(), PoolState::Empty);
        assert!(manager.status().is_empty());
        assert!(manager.backend_ids().is_empty());
        assert_eq!(manager.capability_count(), 0);
        assert!(a.is_closed());
        assert!(b.is_closed());

        let err = manager
            .dispatch("a_ping", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::UnknownCapability { .. }));

        // Stopping an empty pool does nothing; starting again works.
        manager.stop_all().await;
        let report = manager.start_all().await;
        assert_eq!(report.connected.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_all_tolerates_teardown_errors() {
        let launcher = Arc::new(FakeLauncher::new());
        launcher.add(FakeBackend::new("a").with_tools(["ping"]).failing_close());
        let manager = pool(&launcher, vec![BackendDefinition::new("a", "fake")]);
        manager.start_all().await;

        manager.stop_all().await;
        assert_eq!(manager.state(), PoolState::Empty);
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_to_different_backends() {
        let launcher = Arc::new(FakeLauncher::new());
        launcher.add(
            FakeBackend::new("a")
                .with_tools(["ping"])
                .with_delay(Duration::from_millis(30)),
        );
        launcher.add(
            FakeBackend::new("b")
                .with_tools(["ping"])
                .with_delay(Duration::from_millis(30)),
        );
        let manager = pool(
            &launcher,
            vec![BackendDefinition::new("a", "fake"), BackendDefinition::new("b", "fake")],
        );
        manager.start_all().await;

        let (ra, rb) = tokio::join!(
            manager.dispatch("a_ping", serde_json::json!({}), None),
            manager.dispatch("b_ping", serde_json::json!({}), None),
        );
        assert_eq!(text_of(&ra.unwrap()), "a:ping");
        assert_eq!(text_of(&rb.unwrap()), "b:ping");
    }

    #[tokio::test]
    async fn test_uniqueness_bound_holds_after_start() {
        let launcher = Arc::new(FakeLauncher::new());
        launcher.add(FakeBackend::new("a").with_tools(["x", "y", "z"]));
        launcher.add(FakeBackend::new("b").with_tools(["x"]));
        let manager = pool(
            &launcher,
            vec![BackendDefinition::new("a", "fake"), BackendDefinition::new("b", "fake")],
        );
        manager.start_all().await;

        let caps = manager.get_capabilities_for(None);
        let mut names: Vec<&str> = caps.iter().map(|c| c.namespaced_name.as_str()).collect();
        let total = names.len();
        names.dedup();
        assert_eq!(names.len(), total);
        assert!(total <= 4);
    }

    #[tokio::test]
    async fn test_status_counts_match_catalog() {
        let launcher = Arc::new(FakeLauncher::new());
        launcher.add(FakeBackend::new("a").with_tools(["ping", "echo", "read"]));
        launcher.add(FakeBackend::new("b").with_tools(["ping"]));
        let manager = pool(
            &launcher,
            vec![
                BackendDefinition::new("a", "fake"),
                BackendDefinition::new("b", "fake"),
                BackendDefinition::new("missing", "/nonexistent/binary"),
            ],
        );
        let report = manager.start_all().await;
        assert_eq!(report.failed.len(), 1);

        let catalog = manager.get_capabilities_for(None);
        for status in manager.status() {
            let listed = catalog.iter().filter(|c| c.backend_id == status.id).count();
            if status.connected {
                assert_eq!(status.capability_count, listed, "backend {}", status.id);
            } else {
                assert_eq!(status.capability_count, 0);
                assert_eq!(listed, 0);
            }
        }
        assert_eq!(catalog.len(), 4);
    }

    #[tokio::test]
    async fn test_duplicate_ids_collapse_to_last_definition() {
        let (launcher, _a, _b) = two_backends();
        let manager = pool(
            &launcher,
            vec![
                BackendDefinition::new("a", "fake"),
                BackendDefinition::new("a", "fake").with_scopes(["admin"]),
            ],
        );
        manager.start_all().await;

        assert_eq!(manager.status().len(), 1);
        assert_eq!(launcher.launch_count("a"), 1);
        let reader = CallerIdentity::new("reader", ["read"]);
        assert!(manager.get_capabilities_for(Some(&reader)).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rebuilds_keep_latest_snapshot() {
        let launcher = Arc::new(FakeLauncher::new());
        let tools: Vec<String> = (0..200).map(|i| format!("t{i}")).collect();
        let mut definitions = vec![BackendDefinition::new("a", "fake")];
        launcher.add(FakeBackend::new("a").with_tools(&tools));
        for i in 0..8 {
            let id = format!("b{i}");
            launcher.add(FakeBackend::new(&id).with_tools(&tools));
            definitions.push(BackendDefinition::new(&id, "fake"));
        }
        let manager = Arc::new(pool(&launcher, definitions));
        assert!(manager.start_all().await.all_connected());

        for round in 0..100 {
            let mut handles = Vec::new();
            for i in 0..8 {
                let manager = Arc::clone(&manager);
                handles.push(tokio::spawn(async move {
                    manager.refresh_backend(&format!("b{i}")).await
                }));
            }
            let restarting = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                restarting.restart_backend("a").await
            }));
            for handle in handles {
                handle.await.unwrap().unwrap();
            }

            assert!(manager.status()[0].connected);
            assert!(
                manager.registry().contains("a_t0"),
                "stale snapshot after round {round}"
            );
            assert_eq!(manager.capability_count(), 9 * 200);
        }
    }
}
