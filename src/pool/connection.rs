//! A single backend connection and its state machine.
//!
//! `disconnected → connecting → connected → disconnected`. There is no failed
//! state: a failed connect tears down whatever was built, records the error
//! for status reporting, and returns it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::errors::PoolError;
use super::lifecycle::{BackendSession, Launcher};
use super::types::{BackendDefinition, BackendStatus, Capability, ConnectionState};

struct Inner {
    state: ConnectionState,
    session: Option<Arc<dyn BackendSession>>,
    last_error: Option<String>,
    connected_at: Option<DateTime<Utc>>,
}

/// Owns one backend session. Permission-agnostic.
pub struct BackendConnection {
    definition: BackendDefinition,
    launcher: Arc<dyn Launcher>,
    call_timeout: Option<Duration>,
    inner: RwLock<Inner>,
    /// Replaced wholesale on refresh.
    capabilities: RwLock<Arc<Vec<Capability>>>,
}

impl BackendConnection {
    pub fn new(
        definition: BackendDefinition,
        launcher: Arc<dyn Launcher>,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            definition,
            launcher,
            call_timeout,
            inner: RwLock::new(Inner {
                state: ConnectionState::Disconnected,
                session: None,
                last_error: None,
                connected_at: None,
            }),
            capabilities: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &BackendDefinition {
        &self.definition
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.read().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.read().last_error.clone()
    }

    /// The cached capability list. Empty unless connected.
    pub fn capabilities(&self) -> Arc<Vec<Capability>> {
        Arc::clone(&self.capabilities.read())
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Launch the backend, handshake, and fetch its capabilities.
    ///
    /// Succeeds without doing anything when already connected.
    pub async fn connect(&self) -> Result<(), PoolError> {
        {
            let mut inner = self.inner.write();
            match inner.state {
                ConnectionState::Connected => {
                    tracing::warn!(backend = %self.id(), "connect called while already connected");
                    return Ok(());
                }
                ConnectionState::Connecting => {
                    return Err(PoolError::ConnectInProgress {
                        backend: self.id().to_string(),
                    });
                }
                ConnectionState::Disconnected => {
                    inner.state = ConnectionState::Connecting;
                }
            }
        }

        tracing::info!(
            backend = %self.id(),
            command = %self.definition.launch.command,
            "connecting backend"
        );

        let session = match self.launcher.launch(&self.definition).await {
            Ok(session) => session,
            Err(e) => return Err(self.fail_connect(None, e).await),
        };

        {
            let mut inner = self.inner.write();
            inner.session = Some(Arc::clone(&session));
            inner.state = ConnectionState::Connected;
        }

        if let Err(e) = self.refresh_capabilities().await {
            return Err(self.fail_connect(Some(session), e).await);
        }

        {
            let mut inner = self.inner.write();
            inner.last_error = None;
            inner.connected_at = Some(Utc::now());
        }

        tracing::info!(
            backend = %self.id(),
            capabilities = self.capabilities().len(),
            "backend connected"
        );
        Ok(())
    }

    /// Tear down after a failed connect step and build the wrapped error.
    async fn fail_connect(
        &self,
        session: Option<Arc<dyn BackendSession>>,
        cause: PoolError,
    ) -> PoolError {
        if let Some(session) = session {
            if let Err(e) = session.close().await {
                tracing::warn!(backend = %self.id(), error = %e, "teardown after failed connect");
            }
        }

        let err = PoolError::connection(self.id(), cause);
        self.reset(Some(err.to_string()));
        tracing::warn!(backend = %self.id(), error = %err, "backend failed to connect");
        err
    }

    /// Re-query the backend's capability list and swap in the new one.
    ///
    /// Query failures are returned as-is: they come from a live backend that
    /// answered badly, not from a broken connection.
    pub async fn refresh_capabilities(&self) -> Result<(), PoolError> {
        let session = self.live_session()?;
        let capabilities = session.list_capabilities().await?;

        tracing::debug!(
            backend = %self.id(),
            count = capabilities.len(),
            "capabilities refreshed"
        );
        *self.capabilities.write() = Arc::new(capabilities);
        Ok(())
    }

    /// Forward one call to the backend. At most once; never retried.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, PoolError> {
        let session = self.live_session()?;

        let outcome = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, session.call(name, arguments)).await {
                Ok(result) => result,
                Err(_) => Err(PoolError::Timeout {
                    backend: self.id().to_string(),
                    operation: format!("tools/call '{name}'"),
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                }),
            },
            None => session.call(name, arguments).await,
        };

        match outcome {
            Ok(result) => Ok(result),
            Err(cause) => {
                let err = PoolError::execution(self.id(), name, cause);
                if err.is_disconnect() {
                    tracing::warn!(backend = %self.id(), error = %err, "backend channel lost");
                    self.drop_lost_session(&session, err.to_string()).await;
                }
                Err(err)
            }
        }
    }

    /// Close the session and force the state to `disconnected`.
    ///
    /// Idempotent. Teardown errors are logged, never returned.
    pub async fn disconnect(&self) {
        let session = {
            let mut inner = self.inner.write();
            let session = inner.session.take();
            inner.state = ConnectionState::Disconnected;
            inner.connected_at = None;
            session
        };
        *self.capabilities.write() = Arc::new(Vec::new());

        let Some(session) = session else {
            return;
        };

        match session.close().await {
            Ok(()) => tracing::info!(backend = %self.id(), "backend disconnected"),
            Err(e) => tracing::warn!(
                backend = %self.id(),
                error = %e,
                "error during backend teardown (ignored)"
            ),
        }
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn status(&self) -> BackendStatus {
        let inner = self.inner.read();
        let connected = inner.state == ConnectionState::Connected;
        BackendStatus {
            id: self.definition.id.clone(),
            name: self.definition.name.clone(),
            state: inner.state,
            connected,
            capability_count: if connected {
                self.capabilities.read().len()
            } else {
                0
            },
            error: inner.last_error.clone(),
            connected_at: inner.connected_at,
        }
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn live_session(&self) -> Result<Arc<dyn BackendSession>, PoolError> {
        let inner = self.inner.read();
        match (&inner.state, &inner.session) {
            (ConnectionState::Connected, Some(session)) => Ok(Arc::clone(session)),
            _ => Err(PoolError::NotConnected {
                backend: self.id().to_string(),
            }),
        }
    }

    fn reset(&self, error: Option<String>) {
        {
            let mut inner = self.inner.write();
            inner.state = ConnectionState::Disconnected;
            inner.session = None;
            inner.connected_at = None;
            inner.last_error = error;
        }
        *self.capabilities.write() = Arc::new(Vec::new());
    }

    /// Drop a session whose channel died mid-call.
    ///
    /// Only clears state if `session` is still the current one, so a stale
    /// failure cannot knock out a connection that was re-established since.
    async fn drop_lost_session(&self, session: &Arc<dyn BackendSession>, error: String) {
        let current = {
            let inner = self.inner.read();
            inner
                .session
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, session))
        };
        if !current {
            return;
        }
        self.reset(Some(error));

        if let Err(e) = session.close().await {
            tracing::debug!(backend = %self.id(), error = %e, "reaping lost backend");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
