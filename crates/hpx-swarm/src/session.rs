//! Single-flight session management.
//!
//! At most one `request_session` is in flight at any time. Concurrent callers
//! share the pending result. The acquisition runs in its own task, so it
//! completes and settles even if every caller that awaited it is cancelled.
//! Invalidating while an acquisition is pending cancels that task, so a stale
//! acquisition never reaches a fresh connection next to a new one.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::SessionError;

/// The side of the client that can talk to the backend on the manager's
/// behalf.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Issue `request_session` on the active transport and return the `sid`.
    async fn request_session(&self) -> Result<String, SessionError>;

    /// Called once per newly acquired session, after it became current.
    async fn on_session_acquired(&self, session_id: String);
}

type PendingSession = Shared<BoxFuture<'static, Result<String, SessionError>>>;

enum Phase {
    Absent,
    Pending {
        future: PendingSession,
        abort: AbortHandle,
    },
    Ready(String),
}

struct State {
    phase: Phase,
    generation: u64,
}

/// Owner of the current session id.
#[derive(Clone)]
pub struct SessionManager {
    state: Arc<Mutex<State>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                phase: Phase::Absent,
                generation: 0,
            })),
        }
    }

    /// Current session id, if one is established.
    pub fn current(&self) -> Option<String> {
        match &self.state.lock().phase {
            Phase::Ready(id) => Some(id.clone()),
            _ => None,
        }
    }

    /// Get the session, acquiring one if needed.
    ///
    /// The first caller that finds no session starts the acquisition; every
    /// other caller awaits the same result. On failure the pending session
    /// is discarded and the next call starts over.
    pub async fn acquire(&self, backend: Arc<dyn SessionBackend>) -> Result<String, SessionError> {
        let pending = {
            let mut state = self.state.lock();
            let existing = match &state.phase {
                Phase::Ready(id) => return Ok(id.clone()),
                Phase::Pending { future, .. } => Some(future.clone()),
                Phase::Absent => None,
            };
            match existing {
                Some(pending) => pending,
                None => {
                    state.generation += 1;
                    let (future, abort) = self.start(state.generation, backend);
                    state.phase = Phase::Pending {
                        future: future.clone(),
                        abort,
                    };
                    future
                }
            }
        };
        pending.await
    }

    fn start(
        &self,
        generation: u64,
        backend: Arc<dyn SessionBackend>,
    ) -> (PendingSession, AbortHandle) {
        let state = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            debug!(generation, "Requesting new session");
            let result = backend.request_session().await;

            let newly_ready = {
                let mut state = state.lock();
                if state.generation != generation {
                    debug!(generation, "Discarding session from an invalidated acquisition");
                    false
                } else {
                    match &result {
                        Ok(id) => {
                            state.phase = Phase::Ready(id.clone());
                            true
                        }
                        Err(err) => {
                            warn!(error = %err, "Session acquisition failed");
                            state.phase = Phase::Absent;
                            false
                        }
                    }
                }
            };

            if newly_ready && let Ok(id) = &result {
                info!("Session acquired");
                let id = id.clone();
                tokio::spawn(async move { backend.on_session_acquired(id).await });
            }
            result
        });

        let abort = task.abort_handle();
        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => Err(SessionError::acquisition_failed(
                    "session invalidated while acquiring",
                )),
                Err(err) => Err(SessionError::acquisition_failed(format!(
                    "session task failed: {err}"
                ))),
            }
        }
        .boxed()
        .shared();
        (future, abort)
    }

    /// Drop the current or pending session.
    ///
    /// Returns `true` if there was one. A pending acquisition is cancelled and
    /// its waiters fail with [`SessionError::AcquisitionFailed`].
    pub fn invalidate(&self) -> bool {
        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut state.phase, Phase::Absent);
        state.generation += 1;
        match previous {
            Phase::Absent => false,
            Phase::Pending { abort, .. } => {
                debug!(generation = state.generation, "Cancelling pending session acquisition");
                abort.abort();
                true
            }
            Phase::Ready(_) => true,
        }
    }

    /// Drop the session only if `session_id` is still the current one.
    ///
    /// A session the backend rejected may already have been replaced, or a
    /// replacement may be on its way; neither is touched.
    pub fn invalidate_session(&self, session_id: &str) -> bool {
        let mut state = self.state.lock();
        if !matches!(&state.phase, Phase::Ready(id) if id == session_id) {
            return false;
        }
        state.phase = Phase::Absent;
        state.generation += 1;
        true
    }
}
