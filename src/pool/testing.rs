//! In-memory launcher and sessions for exercising the pool without processes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::errors::PoolError;
use super::lifecycle::{BackendSession, Launcher};
use super::types::{error_codes, BackendDefinition, Capability};

/// A scripted backend. Clones share state so tests can poke a backend after
/// handing it to the launcher.
#[derive(Clone)]
pub struct FakeBackend {
    id: String,
    tools: Arc<Mutex<Vec<Capability>>>,
    delay: Option<Duration>,
    fail_list: Arc<AtomicBool>,
    fail_close: bool,
    crashed: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
}

impl FakeBackend {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            tools: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            fail_list: Arc::new(AtomicBool::new(false)),
            fail_close: false,
            crashed: Arc::new(AtomicBool::new(false)),
            closes: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_tools<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        *self.tools.lock() = names
            .into_iter()
            .map(|n| Capability::new(n.as_ref(), &format!("{} on {}", n.as_ref(), self.id)))
            .collect();
        self
    }

    pub fn with_capability(self, capability: Capability) -> Self {
        self.tools.lock().push(capability);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_list(self) -> Self {
        self.fail_list.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn set_list_failure(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn set_tools<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        *self.tools.lock() = names
            .into_iter()
            .map(|n| Capability::new(n.as_ref(), ""))
            .collect();
    }

    /// Simulate the process dying: every later request sees a closed channel.
    pub fn crash(&self) {
        self.crashed.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.crashed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closes.load(Ordering::SeqCst) > 0
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Calls received so far, as `(original name, arguments)`.
    pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.calls.lock().clone()
    }

    fn closed_error(&self) -> PoolError {
        PoolError::ChannelClosed {
            backend: self.id.clone(),
            reason: "stdout closed (process may have exited)".into(),
        }
    }
}

#[async_trait]
impl BackendSession for FakeBackend {
    async fn list_capabilities(&self) -> Result<Vec<Capability>, PoolError> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(PoolError::Server {
                code: error_codes::INTERNAL_ERROR,
                message: "tools/list exploded".into(),
                data: None,
            });
        }
        Ok(self.tools.lock().clone())
    }

    async fn call(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, PoolError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.crashed.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }

        self.calls
            .lock()
            .push((name.to_string(), arguments.clone()));

        let known = self.tools.lock().iter().any(|t| t.name == name);
        if !known {
            return Err(PoolError::Server {
                code: error_codes::INVALID_PARAMS,
                message: format!("unknown tool: {name}"),
                data: None,
            });
        }

        Ok(serde_json::json!({
            "content": [{"type": "text", "text": format!("{}:{name}", self.id)}],
            "arguments": arguments,
        }))
    }

    async fn close(&self) -> Result<(), PoolError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(PoolError::Transport {
                backend: self.id.clone(),
                reason: "kill failed".into(),
            });
        }
        Ok(())
    }
}

/// Hands out registered [`FakeBackend`]s by definition id. Unregistered ids
/// fail like a missing executable.
#[derive(Default)]
pub struct FakeLauncher {
    backends: Mutex<HashMap<String, FakeBackend>>,
    launches: Mutex<HashMap<String, usize>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, backend: FakeBackend) {
        self.backends.lock().insert(backend.id.clone(), backend);
    }

    pub fn launch_count(&self, id: &str) -> usize {
        self.launches.lock().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(
        &self,
        definition: &BackendDefinition,
    ) -> Result<Arc<dyn BackendSession>, PoolError> {
        *self
            .launches
            .lock()
            .entry(definition.id.clone())
            .or_insert(0) += 1;

        let backend = self.backends.lock().get(&definition.id).cloned();
        match backend {
            Some(backend) => Ok(Arc::new(backend)),
            None => Err(PoolError::SpawnFailed {
                backend: definition.id.clone(),
                reason: format!("{}: No such file or directory", definition.launch.command),
            }),
        }
    }
}
