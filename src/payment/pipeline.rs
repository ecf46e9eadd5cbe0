//! ConfirmationPipeline — turns a gateway callback into a confirmed
//! enrollment.
//!
//! 1. Mark the payment `Processing`.
//! 2. Verify the callback. On failure mark it `Failed`, record the error on
//!    the payment step and stop. Nothing is retried here.
//! 3. Build the immutable [`PaymentRecord`] and persist it with the state.
//! 4. Derive the [`ConfirmationData`].
//! 5. Register with the secondary platform. Its outcome is reported but can
//!    never fail the confirmation: the payment has already gone through.

use std::sync::Arc;

use chrono::Local;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::FlowConfig;
use crate::error::{Error, PaymentError};
use crate::persistence::PersistenceManager;
use crate::registration::{RegistrationEngine, RegistrationOutcome, RegistrationRequest};
use crate::workflow::{
    EnrollmentRecord, Facility, PaymentStatus, Plan, StatePatch, Step, WorkflowMachine,
};

use super::model::{GatewayCallback, PaymentRecord, VerificationEnrollment, VerificationRequest};
use super::schedule::ConfirmationData;
use super::verifier::PaymentVerifier;

/// Result of [`ConfirmationPipeline::confirm`].
#[derive(Debug, Clone)]
pub enum ConfirmationOutcome {
    /// Verification did not go through; the user has to try again.
    Failed { error: PaymentError, retryable: bool },
    /// Paid and confirmed. `registration` may still be degraded.
    Confirmed {
        record: PaymentRecord,
        confirmation: ConfirmationData,
        registration: RegistrationOutcome,
    },
}

impl ConfirmationOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }
}

pub struct ConfirmationPipeline {
    verifier: Arc<dyn PaymentVerifier>,
    machine: Arc<WorkflowMachine>,
    persistence: Arc<PersistenceManager>,
    registration: Arc<RegistrationEngine>,
    clock: Arc<dyn Clock>,
    default_facility: Facility,
    currency: String,
}

impl ConfirmationPipeline {
    pub fn new(
        verifier: Arc<dyn PaymentVerifier>,
        machine: Arc<WorkflowMachine>,
        persistence: Arc<PersistenceManager>,
        registration: Arc<RegistrationEngine>,
        clock: Arc<dyn Clock>,
        config: &FlowConfig,
    ) -> Self {
        Self {
            verifier,
            machine,
            persistence,
            registration,
            clock,
            default_facility: config.default_facility.clone(),
            currency: config.currency.clone(),
        }
    }

    /// Run the pipeline for one gateway callback.
    pub async fn confirm(&self, callback: GatewayCallback) -> ConfirmationOutcome {
        let state = self.machine.snapshot().await;
        let Some(plan) = state.selected_plan.clone() else {
            return self.reject_precondition(PaymentError::MissingPlan).await;
        };
        let Some(phone) = state.phone_number.clone() else {
            return self.reject_precondition(PaymentError::MissingPhone).await;
        };
        if state.payment_status == PaymentStatus::Success {
            return match state.payment_record.clone() {
                Some(record) if record.gateway_payment_id() == callback.payment_id => {
                    info!(payment_id = %callback.payment_id, "Payment already confirmed");
                    let facility = state.facility.as_ref().unwrap_or(&self.default_facility);
                    self.complete(phone, &plan, facility, record).await
                }
                paid => {
                    let error = PaymentError::AlreadyPaid {
                        paid: paid
                            .map(|r| r.gateway_payment_id().to_string())
                            .unwrap_or_default(),
                        received: callback.payment_id.clone(),
                    };
                    warn!("Ignoring callback on a paid session: {}", error);
                    ConfirmationOutcome::Failed {
                        error,
                        retryable: false,
                    }
                }
            };
        }
        let currency = if plan.currency.is_empty() {
            self.currency.clone()
        } else {
            plan.currency.clone()
        };

        self.machine
            .update(StatePatch::new().payment_status(PaymentStatus::Processing))
            .await;
        info!(order_id = %callback.order_id, plan = %plan.id, "Verifying payment");

        let request = VerificationRequest {
            order_id: callback.order_id.clone(),
            payment_id: callback.payment_id.clone(),
            signature: callback.signature.clone(),
            enrollment_data: VerificationEnrollment {
                phone_number: phone.clone(),
                sport: plan.sport.clone(),
                plan_id: plan.id.clone(),
            },
            amount: plan.price,
        };
        let verified = match self.verifier.verify(&request).await {
            Ok(verified) => verified,
            Err(e) => return self.fail(e).await,
        };

        let now = self.clock.now();
        let record = PaymentRecord::captured(
            verified.enrollment_id.as_str(),
            &callback,
            plan.price,
            currency,
            now,
        );
        let enrollment = match state.enrollment_record.clone() {
            Some(draft) => EnrollmentRecord {
                id: Some(verified.enrollment_id.clone()),
                ..draft
            },
            None => EnrollmentRecord {
                id: Some(verified.enrollment_id.clone()),
                phone_number: phone.clone(),
                sport: plan.sport.clone(),
                plan_id: plan.id.clone(),
                created_at: now,
            },
        };
        let confirmed = self
            .machine
            .update(
                StatePatch::new()
                    .payment_status(PaymentStatus::Success)
                    .enrollment(enrollment)
                    .payment_record(record.clone())
                    .step(Step::Confirmation),
            )
            .await;
        let persisted = match self.machine.autosave() {
            Some(autosave) => autosave.flush().await,
            None => self.persistence.save(&confirmed).await,
        };
        if !persisted {
            warn!(payment_id = %callback.payment_id, "Payment record not persisted");
        }
        info!(
            enrollment_id = %verified.enrollment_id,
            payment_id = %callback.payment_id,
            "Payment confirmed"
        );

        let facility = state.facility.as_ref().unwrap_or(&self.default_facility);
        self.complete(phone, &plan, facility, record).await
    }

    /// Derive the confirmation from a captured record and register it.
    /// The schedule is anchored on the record so a repeated call yields the
    /// same sessions.
    async fn complete(
        &self,
        phone: String,
        plan: &Plan,
        facility: &Facility,
        record: PaymentRecord,
    ) -> ConfirmationOutcome {
        let captured_at = record.created_at().with_timezone(&Local).naive_local();
        let confirmation = ConfirmationData::build(plan, facility, &record, captured_at);

        let registration = self
            .registration
            .register(&RegistrationRequest::new(phone, plan, &record))
            .await;
        if !registration.is_registered() {
            warn!(
                payment_id = %record.gateway_payment_id(),
                retryable = registration.retryable(),
                "Secondary registration degraded"
            );
        }

        ConfirmationOutcome::Confirmed {
            record,
            confirmation,
            registration,
        }
    }

    async fn fail(&self, error: PaymentError) -> ConfirmationOutcome {
        error!("Payment verification failed: {}", error);
        self.machine
            .update(StatePatch::new().payment_status(PaymentStatus::Failed))
            .await;
        self.machine.set_error(Step::Payment, error.to_string()).await;
        let retryable = Error::from(error.clone()).is_retryable();
        ConfirmationOutcome::Failed { error, retryable }
    }

    async fn reject_precondition(&self, error: PaymentError) -> ConfirmationOutcome {
        warn!("Cannot confirm payment: {}", error);
        self.machine.set_error(Step::Payment, error.to_string()).await;
        ConfirmationOutcome::Failed {
            error,
            retryable: false,
        }
    }
}
