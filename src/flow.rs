//! EnrollmentFlow — wires the workflow components together for one session.

use std::sync::Arc;

use tracing::info;

use crate::auth::{OtpTransport, PhoneAuthenticator};
use crate::clock::Clock;
use crate::config::FlowConfig;
use crate::error::ConfigError;
use crate::payment::{ConfirmationPipeline, PaymentVerifier};
use crate::persistence::{AutoSaver, PersistenceManager};
use crate::recovery::RecoveryManager;
use crate::registration::{
    AttemptLedger, RegistrationEngine, RegistrationOutcome, RegistrationRequest, SecondaryPlatform,
};
use crate::session::SessionSupervisor;
use crate::store::Storage;
use crate::workflow::{StatePatch, WorkflowMachine};

/// External collaborators the flow is built on.
pub struct FlowDeps {
    pub storage: Arc<dyn Storage>,
    pub clock: Arc<dyn Clock>,
    pub verifier: Arc<dyn PaymentVerifier>,
    pub platform: Arc<dyn SecondaryPlatform>,
    pub otp: Arc<dyn OtpTransport>,
}

/// One enrollment session and everything attached to it.
pub struct EnrollmentFlow {
    config: FlowConfig,
    persistence: Arc<PersistenceManager>,
    autosave: Arc<AutoSaver>,
    machine: Arc<WorkflowMachine>,
    recovery: RecoveryManager,
    supervisor: Arc<SessionSupervisor>,
    authenticator: PhoneAuthenticator,
    engine: Arc<RegistrationEngine>,
    pipeline: ConfirmationPipeline,
}

impl EnrollmentFlow {
    /// Build a flow. The ledger is created fresh; use
    /// [`EnrollmentFlow::with_ledger`] to share one across flows.
    pub fn new(config: FlowConfig, deps: FlowDeps) -> Result<Self, ConfigError> {
        let ledger = Arc::new(AttemptLedger::new(config.registration.max_attempts));
        Self::with_ledger(config, deps, ledger)
    }

    pub fn with_ledger(
        config: FlowConfig,
        deps: FlowDeps,
        ledger: Arc<AttemptLedger>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let persistence = Arc::new(PersistenceManager::new(
            Arc::clone(&deps.storage),
            Arc::clone(&deps.clock),
            &config,
        ));
        let autosave = Arc::new(AutoSaver::new(Arc::clone(&persistence), config.autosave_debounce));
        let machine = Arc::new(WorkflowMachine::new(Arc::clone(&autosave)));
        let recovery = RecoveryManager::new(Arc::clone(&persistence));
        let supervisor = Arc::new(
            SessionSupervisor::new(Arc::clone(&persistence), &config)
                .with_autosave(Arc::clone(&autosave)),
        );
        let authenticator =
            PhoneAuthenticator::new(deps.otp, Arc::clone(&machine), Arc::clone(&deps.clock))
                .with_supervisor(Arc::clone(&supervisor));
        let engine = Arc::new(RegistrationEngine::new(
            deps.platform,
            deps.storage,
            ledger,
            Arc::clone(&deps.clock),
            &config.registration,
            &config.storage_key,
        ));
        let pipeline = ConfirmationPipeline::new(
            deps.verifier,
            Arc::clone(&machine),
            Arc::clone(&persistence),
            Arc::clone(&engine),
            deps.clock,
            &config,
        );

        Ok(Self {
            config,
            persistence,
            autosave,
            machine,
            recovery,
            supervisor,
            authenticator,
            engine,
            pipeline,
        })
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn machine(&self) -> &Arc<WorkflowMachine> {
        &self.machine
    }

    pub fn persistence(&self) -> &Arc<PersistenceManager> {
        &self.persistence
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    pub fn authenticator(&self) -> &PhoneAuthenticator {
        &self.authenticator
    }

    pub fn pipeline(&self) -> &ConfirmationPipeline {
        &self.pipeline
    }

    pub fn engine(&self) -> &Arc<RegistrationEngine> {
        &self.engine
    }

    /// Recover stored state into the machine and re-arm the session timers
    /// for whatever the recovered session had left.
    pub async fn resume(&self) -> Option<StatePatch> {
        let expires_at = self.persistence.load_envelope().await?.expires_at;
        let patch = self.recovery.recover_into(&self.machine).await?;
        if self.machine.snapshot().await.is_authenticated {
            self.supervisor.resume_until(expires_at).await;
        }
        Some(patch)
    }

    /// The registration request for the confirmed payment in the live state.
    pub async fn pending_registration(&self) -> Option<RegistrationRequest> {
        let state = self.machine.snapshot().await;
        let phone = state.phone_number?;
        let plan = state.selected_plan?;
        let record = state.payment_record?;
        Some(RegistrationRequest::new(phone, &plan, &record))
    }

    /// Re-run registration after an in-flight outcome or an operator reset.
    pub async fn retry_registration(&self, request: &RegistrationRequest) -> RegistrationOutcome {
        info!(key = %request.key(), "Retrying secondary registration");
        self.engine.register(request).await
    }

    /// The confirmation has been shown: forget the session entirely.
    pub async fn complete(&self) {
        self.supervisor.clear().await;
        self.machine.reset().await;
        info!("Enrollment flow completed");
    }

    /// Flush any pending save and stop the session timers.
    pub async fn shutdown(&self) -> bool {
        let flushed = self.autosave.flush().await;
        self.supervisor.dispose().await;
        flushed
    }
}
