//! Recovery — decides whether a stored snapshot can be resumed and merges it
//! back into the live workflow.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, WorkflowError};
use crate::persistence::PersistenceManager;
use crate::workflow::{StatePatch, Step, WorkflowMachine};

/// What the "resume where you left off?" prompt needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryInfo {
    pub can_recover: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_step: Option<Step>,
}

/// Offers, performs and discards recovery of persisted workflow state.
pub struct RecoveryManager {
    persistence: Arc<PersistenceManager>,
}

impl RecoveryManager {
    pub fn new(persistence: Arc<PersistenceManager>) -> Self {
        Self { persistence }
    }

    /// Whether a non-expired snapshot is stored.
    pub async fn can_recover(&self) -> bool {
        self.persistence.load_envelope().await.is_some()
    }

    /// Describe the stored snapshot without recovering it.
    pub async fn recovery_info(&self) -> RecoveryInfo {
        match self.persistence.load_envelope().await {
            Some(envelope) => RecoveryInfo {
                can_recover: true,
                age_minutes: Some(envelope.age_minutes(self.persistence.clock().now_millis())),
                last_step: envelope.state.current_step,
            },
            None => RecoveryInfo {
                can_recover: false,
                age_minutes: None,
                last_step: None,
            },
        }
    }

    /// Load the stored snapshot and hand it to `on_recovered`.
    ///
    /// Returns `None` when nothing is stored. If the snapshot is inconsistent
    /// or `on_recovered` fails, `on_failed` is called, the slot is cleared and
    /// `None` is returned; the error is never propagated.
    pub async fn recover<F, Fut, E>(&self, on_recovered: F, on_failed: E) -> Option<StatePatch>
    where
        F: FnOnce(StatePatch) -> Fut,
        Fut: Future<Output = Result<(), Error>>,
        E: FnOnce(&Error),
    {
        let patch = self.persistence.load().await?;

        let result = match check_consistency(&patch) {
            Ok(()) => on_recovered(patch.clone()).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => {
                info!(step = ?patch.current_step, "Workflow state recovered");
                Some(patch)
            }
            Err(e) => {
                warn!("Workflow recovery failed: {}", e);
                on_failed(&e);
                self.persistence.clear().await;
                None
            }
        }
    }

    /// Recover straight into `machine`.
    ///
    /// Matching keys are overwritten wholesale; nested values such as the
    /// selected plan are replaced, not merged.
    pub async fn recover_into(&self, machine: &WorkflowMachine) -> Option<StatePatch> {
        self.recover(
            |patch| async move {
                machine.update(patch).await;
                Ok::<(), Error>(())
            },
            |_| {},
        )
        .await
    }

    /// Throw the stored snapshot away ("start fresh").
    pub async fn discard(&self) -> bool {
        info!("Discarding stored workflow state");
        self.persistence.clear().await
    }
}

/// Reject snapshots that could not have been produced by a real session.
fn check_consistency(patch: &StatePatch) -> Result<(), WorkflowError> {
    let authenticated = patch.is_authenticated.unwrap_or(false);
    let has_phone = matches!(patch.phone_number, Some(Some(_)));
    if authenticated && !has_phone {
        return Err(WorkflowError::InconsistentSnapshot(
            "authenticated without a phone number".to_string(),
        ));
    }
    if let Some(step) = patch.current_step {
        if step > Step::Auth && !authenticated {
            return Err(WorkflowError::InconsistentSnapshot(format!(
                "at step {step} without authentication"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::FlowConfig;
    use crate::store::MemoryStorage;
    use crate::workflow::{Plan, WorkflowState};

    fn setup() -> (Arc<ManualClock>, Arc<PersistenceManager>, RecoveryManager) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let persistence = Arc::new(PersistenceManager::new(
            Arc::new(MemoryStorage::new()),
            clock.clone(),
            &FlowConfig::default(),
        ));
        let recovery = RecoveryManager::new(persistence.clone());
        (clock, persistence, recovery)
    }

    fn plan(id: &str) -> Plan {
        Plan {
            id: id.to_string(),
            name: id.to_string(),
            sport: "tennis".to_string(),
            duration_months: 1,
            price: dec!(2000),
            currency: "INR".to_string(),
        }
    }

    fn pricing_state() -> WorkflowState {
        WorkflowState {
            current_step: Step::Pricing,
            phone_number: Some("+919876543210".to_string()),
            is_authenticated: true,
            selected_plan: Some(plan("stored")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn info_without_state() {
        let (_, _, recovery) = setup();
        assert!(!recovery.can_recover().await);
        assert_eq!(
            recovery.recovery_info().await,
            RecoveryInfo {
                can_recover: false,
                age_minutes: None,
                last_step: None
            }
        );
    }

    #[tokio::test]
    async fn info_reports_age_and_step() {
        let (clock, persistence, recovery) = setup();
        persistence.save(&pricing_state()).await;
        clock.advance(Duration::minutes(4));

        let info = recovery.recovery_info().await;
        assert!(info.can_recover);
        assert_eq!(info.age_minutes, Some(4));
        assert_eq!(info.last_step, Some(Step::Pricing));
    }

    #[tokio::test]
    async fn expired_state_is_not_recoverable() {
        let (clock, persistence, recovery) = setup();
        persistence.save(&pricing_state()).await;
        clock.advance(Duration::minutes(31));
        assert!(!recovery.can_recover().await);
    }

    #[tokio::test]
    async fn recover_into_replaces_nested_values() {
        let (_, persistence, recovery) = setup();
        persistence.save(&pricing_state()).await;

        let machine = WorkflowMachine::in_memory();
        machine
            .update(StatePatch::new().authenticated(true).phone("+919000000000").plan(plan("live")))
            .await;

        let patch = recovery.recover_into(&machine).await.unwrap();
        assert_eq!(patch.current_step, Some(Step::Pricing));

        let state = machine.snapshot().await;
        assert_eq!(state.current_step, Step::Pricing);
        assert_eq!(state.phone_number.as_deref(), Some("+919876543210"));
        assert_eq!(state.selected_plan.unwrap().id, "stored");
    }

    #[tokio::test]
    async fn failing_callback_reports_and_returns_none() {
        let (_, persistence, recovery) = setup();
        persistence.save(&pricing_state()).await;

        let failed = Mutex::new(None);
        let result = recovery
            .recover(
                |_| async { Err(Error::from(WorkflowError::AtLastStep)) },
                |e| *failed.lock().unwrap() = Some(e.to_string()),
            )
            .await;

        assert!(result.is_none());
        assert!(failed.lock().unwrap().is_some());
        assert!(!recovery.can_recover().await);
    }

    #[tokio::test]
    async fn inconsistent_snapshot_is_refused() {
        let (_, persistence, recovery) = setup();
        persistence
            .save_patch(&StatePatch::new().step(Step::Payment).authenticated(false))
            .await;

        let called = Mutex::new(false);
        let failed = Mutex::new(false);
        let result = recovery
            .recover(
                |_| async {
                    *called.lock().unwrap() = true;
                    Ok::<(), Error>(())
                },
                |_| *failed.lock().unwrap() = true,
            )
            .await;
        assert!(result.is_none());
        assert!(!*called.lock().unwrap());
        assert!(*failed.lock().unwrap());
    }

    #[tokio::test]
    async fn discard_clears_without_recovering() {
        let (_, persistence, recovery) = setup();
        persistence.save(&pricing_state()).await;
        assert!(recovery.discard().await);
        assert!(!recovery.can_recover().await);
    }
}
