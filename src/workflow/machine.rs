//! WorkflowMachine — holds the live state and is the single entry point for
//! mutating it.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::WorkflowError;
use crate::persistence::AutoSaver;

use super::state::{StatePatch, Step, WorkflowState};

/// Whether every step strictly before `target` is complete in `state`.
pub fn can_proceed(state: &WorkflowState, target: Step) -> bool {
    target.predecessors().iter().all(|s| s.is_complete(state))
}

/// The first incomplete step before `target`, if any.
pub fn first_blocking(state: &WorkflowState, target: Step) -> Option<Step> {
    target
        .predecessors()
        .iter()
        .copied()
        .find(|s| !s.is_complete(state))
}

/// Pull the current step back when its entry requirements are missing.
///
/// Payment without a plan returns to pricing; confirmation without an
/// enrollment id returns to payment.
fn apply_guards(state: &mut WorkflowState) {
    match state.current_step {
        Step::Payment if state.selected_plan.is_none() => {
            warn!("Entered payment without a plan, returning to pricing");
            state.current_step = Step::Pricing;
        }
        Step::Confirmation
            if !state
                .enrollment_record
                .as_ref()
                .is_some_and(|r| r.id.is_some()) =>
        {
            warn!("Entered confirmation without an enrollment, returning to payment");
            state.current_step = Step::Payment;
            apply_guards(state);
        }
        _ => {}
    }
}

/// Owns the live workflow state for one enrollment session.
pub struct WorkflowMachine {
    state: RwLock<WorkflowState>,
    autosave: Option<Arc<AutoSaver>>,
}

impl WorkflowMachine {
    /// A machine that persists through `autosave`.
    pub fn new(autosave: Arc<AutoSaver>) -> Self {
        Self {
            state: RwLock::new(WorkflowState::default()),
            autosave: Some(autosave),
        }
    }

    /// A machine with no persistence behind it.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(WorkflowState::default()),
            autosave: None,
        }
    }

    pub fn autosave(&self) -> Option<&Arc<AutoSaver>> {
        self.autosave.as_ref()
    }

    /// A copy of the current state.
    pub async fn snapshot(&self) -> WorkflowState {
        self.state.read().await.clone()
    }

    pub async fn current_step(&self) -> Step {
        self.state.read().await.current_step
    }

    /// Apply `patch`, returning the resulting state.
    ///
    /// 1. Shallow-merge the patch.
    /// 2. Bounce the step back if its entry requirements are missing.
    /// 3. If the step changed, clear the error of the step being left.
    /// 4. Schedule a debounced save.
    pub async fn update(&self, patch: StatePatch) -> WorkflowState {
        let snapshot = {
            let mut state = self.state.write().await;
            let previous = state.current_step;

            state.apply(patch);
            apply_guards(&mut state);

            if state.current_step != previous {
                state.errors_by_step.remove(&previous);
                info!(from = %previous, to = %state.current_step, "Workflow step changed");
            }
            state.clone()
        };

        if let Some(autosave) = &self.autosave {
            autosave.schedule(snapshot.clone());
        }
        snapshot
    }

    /// Whether `step`'s completion predicate holds right now.
    pub async fn is_step_complete(&self, step: Step) -> bool {
        step.is_complete(&*self.state.read().await)
    }

    /// Whether every step before `target` is complete right now.
    ///
    /// Always evaluated against the live state: plan and payment can be
    /// cleared by error recovery at any time.
    pub async fn can_proceed_to(&self, target: Step) -> bool {
        can_proceed(&*self.state.read().await, target)
    }

    /// Move to the next step if its predecessors are complete.
    pub async fn advance(&self) -> Result<Step, WorkflowError> {
        let (next, blocking) = {
            let state = self.state.read().await;
            let next = state.current_step.next().ok_or(WorkflowError::AtLastStep)?;
            (next, first_blocking(&state, next))
        };
        if let Some(blocking) = blocking {
            debug!(target = %next, blocking = %blocking, "Advance blocked");
            return Err(WorkflowError::Blocked {
                target: next.to_string(),
                blocking: blocking.to_string(),
            });
        }
        Ok(self.update(StatePatch::new().step(next)).await.current_step)
    }

    /// Record an inline error for `step`.
    pub async fn set_error(&self, step: Step, message: impl Into<String>) {
        let mut errors = self.state.read().await.errors_by_step.clone();
        errors.insert(step, message.into());
        self.update(StatePatch::new().errors(errors)).await;
    }

    pub async fn clear_error(&self, step: Step) {
        let mut errors = self.state.read().await.errors_by_step.clone();
        if errors.remove(&step).is_some() {
            self.update(StatePatch::new().errors(errors)).await;
        }
    }

    pub async fn error_for(&self, step: Step) -> Option<String> {
        self.state.read().await.errors_by_step.get(&step).cloned()
    }

    /// Discard everything: back to a fresh state with nothing stored.
    pub async fn reset(&self) {
        *self.state.write().await = WorkflowState::default();
        if let Some(autosave) = &self.autosave {
            autosave.discard().await;
        }
        info!("Workflow state reset");
    }
}
