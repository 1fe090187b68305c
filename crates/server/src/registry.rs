//! Session registry
//!
//! Process-wide table of live sessions keyed by client task id. Enforces
//! the global session ceiling and task-id uniqueness at registration, and
//! runs a background sweep that evicts idle sessions by signalling their
//! connection task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::watch;

/// Registration failures; both reject the start, nothing is queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("session ceiling reached ({limit})")]
    Full { limit: usize },

    #[error("task id already registered: {0}")]
    DuplicateTaskId(String),
}

/// Registry entry for one live session.
///
/// The connection task owns the session's state; this handle only carries
/// what the sweep needs: activity tracking and a way to ask the task to
/// shut down.
#[derive(Debug)]
pub struct SessionHandle {
    task_id: String,
    session_id: String,
    created_at: Instant,
    last_activity: RwLock<Instant>,
    cancel: watch::Sender<bool>,
}

impl SessionHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Server-generated handle echoed to the client in `SynthesisStarted`.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_activity.read().elapsed() > timeout
    }

    /// Ask the owning connection task to tear the session down.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Global table of active sessions
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    max_sessions: usize,
    idle_timeout: Duration,
    sweep_interval: Duration,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, idle_timeout: Duration, sweep_interval: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            idle_timeout,
            sweep_interval,
        }
    }

    /// Insert a new session keyed by its client-supplied task id.
    ///
    /// Returns the handle plus the cancellation receiver the connection
    /// task must watch for idle eviction.
    pub fn register(
        &self,
        task_id: &str,
    ) -> Result<(Arc<SessionHandle>, watch::Receiver<bool>), RegistryError> {
        let mut sessions = self.sessions.write();

        if sessions.len() >= self.max_sessions {
            return Err(RegistryError::Full {
                limit: self.max_sessions,
            });
        }
        if sessions.contains_key(task_id) {
            return Err(RegistryError::DuplicateTaskId(task_id.to_string()));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = Arc::new(SessionHandle {
            task_id: task_id.to_string(),
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            created_at: Instant::now(),
            last_activity: RwLock::new(Instant::now()),
            cancel: cancel_tx,
        });
        sessions.insert(task_id.to_string(), Arc::clone(&handle));

        tracing::info!(task_id, session_id = %handle.session_id, "session registered");
        Ok((handle, cancel_rx))
    }

    pub fn lookup(&self, task_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(task_id).cloned()
    }

    /// Remove a session. Safe to call from any teardown path; removing an
    /// already-removed handle is a no-op.
    pub fn deregister(&self, handle: &Arc<SessionHandle>) {
        if self.remove_current(handle) {
            tracing::info!(task_id = %handle.task_id(), "session deregistered");
        }
    }

    /// Remove the entry for this exact handle. The task id may have been
    /// re-registered by a newer session after an eviction; a stale
    /// teardown must not remove that one.
    fn remove_current(&self, handle: &Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(handle.task_id()) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                sessions.remove(handle.task_id());
                true
            }
            _ => false,
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// One sweep pass: signal and drop every expired session.
    pub fn sweep_idle(&self) -> usize {
        let expired: Vec<Arc<SessionHandle>> = {
            let sessions = self.sessions.read();
            sessions
                .values()
                .filter(|s| s.is_expired(self.idle_timeout))
                .cloned()
                .collect()
        };

        let mut evicted = 0;
        for handle in expired {
            handle.cancel();
            if self.remove_current(&handle) {
                tracing::info!(task_id = %handle.task_id(), "idle session evicted");
                evicted += 1;
            }
        }
        evicted
    }

    /// Start the periodic idle sweep. Returns the shutdown sender; flip it
    /// to true to stop the task.
    pub fn start_sweep_task(self: &Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let registry = Arc::clone(self);
        let interval = registry.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = registry.sweep_idle();
                        if evicted > 0 {
                            tracing::info!(evicted, remaining = registry.count(), "idle sweep");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("idle sweep task shutting down");
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }
}
