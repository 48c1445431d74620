use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

/// Lifecycle of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Accepting and serving connections
    Active,
    /// Refusing new connections, warning and closing existing ones
    Draining,
    /// Every connection is gone and its presence removed
    Closed,
}

/// Shared view of the worker state.
///
/// Moves strictly forward: `Active -> Draining -> Closed`.
#[derive(Clone)]
pub struct Lifecycle {
    state: Arc<watch::Sender<WorkerState>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(watch::Sender::new(WorkerState::Active)),
        }
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == WorkerState::Active
    }

    /// Ask the worker to drain. Returns false if it already left `Active`.
    pub fn request_drain(&self) -> bool {
        let requested = self.state.send_if_modified(|state| {
            if *state == WorkerState::Active {
                *state = WorkerState::Draining;
                true
            } else {
                false
            }
        });
        if requested {
            info!("Drain requested");
        }
        requested
    }

    pub fn mark_closed(&self) {
        self.state.send_replace(WorkerState::Closed);
    }

    /// Resolves once the worker leaves `Active`.
    pub async fn drain_requested(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state != WorkerState::Active).await;
    }

    /// Resolves once the worker reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == WorkerState::Closed).await;
    }
}
