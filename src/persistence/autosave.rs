//! Debounced auto-save.
//!
//! Every state mutation schedules a save; only the last snapshot within the
//! debounce window is written. Saves are serialized so an older snapshot can
//! never land after a newer one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::workflow::WorkflowState;

use super::manager::PersistenceManager;

#[derive(Default)]
struct Pending {
    generation: u64,
    state: Option<WorkflowState>,
}

/// Debounces saves into a [`PersistenceManager`].
pub struct AutoSaver {
    persistence: Arc<PersistenceManager>,
    debounce: Duration,
    pending: Arc<Mutex<Pending>>,
    save_lock: Arc<tokio::sync::Mutex<()>>,
}

impl AutoSaver {
    pub fn new(persistence: Arc<PersistenceManager>, debounce: Duration) -> Self {
        Self {
            persistence,
            debounce,
            pending: Arc::new(Mutex::new(Pending::default())),
            save_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn persistence(&self) -> &Arc<PersistenceManager> {
        &self.persistence
    }

    /// Replace the pending snapshot and restart the debounce timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, state: WorkflowState) {
        let generation = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.generation += 1;
            pending.state = Some(state);
            pending.generation
        };

        let pending = Arc::clone(&self.pending);
        let save_lock = Arc::clone(&self.save_lock);
        let persistence = Arc::clone(&self.persistence);
        let debounce = self.debounce;

        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let _guard = save_lock.lock().await;
            let state = {
                let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
                if pending.generation != generation {
                    // Superseded by a later schedule, flush or cancel.
                    return;
                }
                pending.state.take()
            };
            if let Some(state) = state {
                persistence.save(&state).await;
            }
        });
    }

    /// Write the pending snapshot now. Returns whether one was written.
    pub async fn flush(&self) -> bool {
        let _guard = self.save_lock.lock().await;
        let state = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.generation += 1;
            pending.state.take()
        };
        match state {
            Some(state) => {
                debug!("Flushing pending workflow state");
                self.persistence.save(&state).await
            }
            None => false,
        }
    }

    /// Drop the pending snapshot without writing it.
    pub fn cancel(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.generation += 1;
        pending.state = None;
    }

    /// Drop the pending snapshot and remove the stored envelope.
    ///
    /// Holds the save lock, so a timer that already claimed its snapshot
    /// finishes writing before the slot is cleared.
    pub async fn discard(&self) -> bool {
        let _guard = self.save_lock.lock().await;
        self.cancel();
        self.persistence.clear().await
    }

    pub fn has_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state
            .is_some()
    }
}
