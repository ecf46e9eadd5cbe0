//! Phone authentication — number validation and the OTP send/verify flow.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::AuthError;
use crate::registration::{BackoffPolicy, RetryError, retry};
use crate::session::SessionSupervisor;
use crate::workflow::{StatePatch, Step, WorkflowMachine};

/// Minimum gap between two OTP sends.
pub const RESEND_COOLDOWN: Duration = Duration::from_secs(30);
/// OTP sends allowed per authenticator.
pub const MAX_SENDS: u32 = 5;
/// Transport attempts per send.
const SEND_ATTEMPTS: u32 = 3;
const CODE_LENGTH: usize = 6;

static INDIAN_MOBILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\+91|91|0)?([6-9]\d{9})$").expect("mobile pattern is valid")
});

/// Validate an Indian mobile number and normalise it to `+91XXXXXXXXXX`.
///
/// Spaces, dashes and parentheses are ignored. A `+91`, `91` or `0` prefix
/// is accepted.
pub fn normalize_phone(raw: &str) -> Result<String, AuthError> {
    let compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '(' | ')'))
        .collect();
    INDIAN_MOBILE
        .captures(&compact)
        .and_then(|c| c.get(1))
        .map(|digits| format!("+91{}", digits.as_str()))
        .ok_or_else(|| AuthError::InvalidPhone(raw.to_string()))
}

/// Delivers and checks one-time codes.
#[async_trait]
pub trait OtpTransport: Send + Sync {
    /// Send a code to `phone_number`, returning a handle for verification.
    async fn send_otp(&self, phone_number: &str) -> Result<String, AuthError>;

    /// Whether `code` matches the one sent under `handle`.
    async fn verify_otp(&self, handle: &str, code: &str) -> Result<bool, AuthError>;
}

/// A code was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpChallenge {
    pub phone_number: String,
    pub sends_remaining: u32,
    pub resend_available_at: DateTime<Utc>,
}

struct Pending {
    phone_number: String,
    handle: String,
}

#[derive(Default)]
struct AuthInner {
    pending: Option<Pending>,
    sends: u32,
    last_sent_at: Option<DateTime<Utc>>,
}

/// Runs phone verification and marks the workflow authenticated.
pub struct PhoneAuthenticator {
    transport: Arc<dyn OtpTransport>,
    machine: Arc<WorkflowMachine>,
    clock: Arc<dyn Clock>,
    supervisor: Option<Arc<SessionSupervisor>>,
    policy: BackoffPolicy,
    cooldown: Duration,
    max_sends: u32,
    inner: Mutex<AuthInner>,
}

impl PhoneAuthenticator {
    pub fn new(
        transport: Arc<dyn OtpTransport>,
        machine: Arc<WorkflowMachine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            machine,
            clock,
            supervisor: None,
            policy: BackoffPolicy::default(),
            cooldown: RESEND_COOLDOWN,
            max_sends: MAX_SENDS,
            inner: Mutex::new(AuthInner::default()),
        }
    }

    /// Arm session timers on login and cancel them on logout.
    pub fn with_supervisor(mut self, supervisor: Arc<SessionSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_limits(mut self, cooldown: Duration, max_sends: u32) -> Self {
        self.cooldown = cooldown;
        self.max_sends = max_sends;
        self
    }

    /// Send a code to `raw_phone`.
    ///
    /// Transport failures are retried with backoff before giving up. Only
    /// delivered codes count against the send budget and start the cooldown.
    pub async fn send_code(&self, raw_phone: &str) -> Result<OtpChallenge, AuthError> {
        let phone = normalize_phone(raw_phone)?;
        let mut inner = self.inner.lock().await;

        if inner.sends >= self.max_sends {
            return Err(AuthError::SendBudgetExhausted { max: self.max_sends });
        }
        let now = self.clock.now();
        if let Some(last) = inner.last_sent_at {
            let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
            if elapsed < self.cooldown {
                return Err(AuthError::Cooldown {
                    wait: self.cooldown - elapsed,
                });
            }
        }

        let handle = retry(1..=SEND_ATTEMPTS, &self.policy, AuthError::is_transient, |_| {
            self.transport.send_otp(&phone)
        })
        .await
        .map_err(|e| match e {
            RetryError::NonRetryable { error, .. } | RetryError::Exhausted { error, .. } => error,
            RetryError::NoAttemptsLeft => AuthError::Transport("no send attempts configured".into()),
        })?;

        inner.sends += 1;
        inner.last_sent_at = Some(now);
        inner.pending = Some(Pending {
            phone_number: phone.clone(),
            handle,
        });
        info!(sends = inner.sends, "OTP sent");

        Ok(OtpChallenge {
            phone_number: phone,
            sends_remaining: self.max_sends - inner.sends,
            resend_available_at: now
                + chrono::Duration::from_std(self.cooldown).unwrap_or_else(|_| chrono::Duration::zero()),
        })
    }

    /// Check `code` against the last code sent.
    ///
    /// On success the workflow moves to the facility step as authenticated.
    pub async fn verify_code(&self, code: &str) -> Result<(), AuthError> {
        let code = code.trim();
        if code.len() != CODE_LENGTH || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(AuthError::InvalidCode);
        }

        let phone = {
            let inner = self.inner.lock().await;
            let pending = inner.pending.as_ref().ok_or(AuthError::NoPendingVerification)?;
            if !self.transport.verify_otp(&pending.handle, code).await? {
                warn!("OTP rejected");
                return Err(AuthError::InvalidCode);
            }
            pending.phone_number.clone()
        };
        self.inner.lock().await.pending = None;

        self.machine
            .update(
                StatePatch::new()
                    .phone(phone)
                    .authenticated(true)
                    .step(Step::Facility),
            )
            .await;
        if let Some(supervisor) = &self.supervisor {
            supervisor.set_authenticated(true).await;
        }
        info!("Phone verified");
        Ok(())
    }

    /// Drop authentication and stop the session timers.
    pub async fn sign_out(&self) {
        self.inner.lock().await.pending = None;
        self.machine
            .update(StatePatch::new().authenticated(false).step(Step::Auth))
            .await;
        if let Some(supervisor) = &self.supervisor {
            supervisor.set_authenticated(false).await;
        }
    }

    /// Codes that can still be sent.
    pub async fn sends_remaining(&self) -> u32 {
        self.max_sends.saturating_sub(self.inner.lock().await.sends)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn accepts_common_formats() {
        for raw in [
            "9876543210",
            "+91 98765 43210",
            "+91-98765-43210",
            "91 9876543210",
            "09876543210",
            "(987) 654-3210",
        ] {
            assert_eq!(normalize_phone(raw).unwrap(), "+919876543210", "{raw}");
        }
    }

    #[test]
    fn rejects_bad_numbers() {
        for raw in ["", "12345", "5876543210", "98765432101", "+1 9876543210", "98765abcde"] {
            assert!(
                matches!(normalize_phone(raw), Err(AuthError::InvalidPhone(_))),
                "{raw} should be rejected"
            );
        }
    }

    /// Fails the first `failures` sends, then hands out numbered handles.
    #[derive(Default)]
    struct FakeTransport {
        failures: AtomicU32,
        sends: AtomicU32,
        code: StdMutex<String>,
    }

    impl FakeTransport {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                code: StdMutex::new("123456".into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl OtpTransport for FakeTransport {
        async fn send_otp(&self, _: &str) -> Result<String, AuthError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(AuthError::Transport("sms gateway down".into()));
            }
            let n = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("handle_{n}"))
        }

        async fn verify_otp(&self, handle: &str, code: &str) -> Result<bool, AuthError> {
            Ok(handle.starts_with("handle_") && *self.code.lock().unwrap() == code)
        }
    }

    fn setup(failures: u32) -> (Arc<ManualClock>, Arc<WorkflowMachine>, PhoneAuthenticator) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let machine = Arc::new(WorkflowMachine::in_memory());
        let auth = PhoneAuthenticator::new(Arc::new(FakeTransport::new(failures)), machine.clone(), clock.clone());
        (clock, machine, auth)
    }

    #[tokio::test(start_paused = true)]
    async fn verify_marks_workflow_authenticated() {
        let (_, machine, auth) = setup(0);
        let challenge = auth.send_code("98765 43210").await.unwrap();
        assert_eq!(challenge.phone_number, "+919876543210");
        assert_eq!(challenge.sends_remaining, 4);

        assert!(matches!(auth.verify_code("000000").await, Err(AuthError::InvalidCode)));
        auth.verify_code("123456").await.unwrap();

        let state = machine.snapshot().await;
        assert!(state.is_authenticated);
        assert_eq!(state.current_step, Step::Facility);
        assert_eq!(state.phone_number.as_deref(), Some("+919876543210"));
    }

    #[tokio::test]
    async fn verify_without_send_fails() {
        let (_, _, auth) = setup(0);
        assert!(matches!(
            auth.verify_code("123456").await,
            Err(AuthError::NoPendingVerification)
        ));
        assert!(matches!(auth.verify_code("12ab").await, Err(AuthError::InvalidCode)));
    }

    #[tokio::test(start_paused = true)]
    async fn resend_respects_cooldown() {
        let (clock, _, auth) = setup(0);
        auth.send_code("9876543210").await.unwrap();

        clock.advance(chrono::Duration::seconds(10));
        match auth.send_code("9876543210").await {
            Err(AuthError::Cooldown { wait }) => assert_eq!(wait, Duration::from_secs(20)),
            other => panic!("expected cooldown, got {other:?}"),
        }

        clock.advance(chrono::Duration::seconds(20));
        assert!(auth.send_code("9876543210").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn send_budget_is_enforced() {
        let (clock, _, auth) = setup(0);
        for _ in 0..MAX_SENDS {
            auth.send_code("9876543210").await.unwrap();
            clock.advance(chrono::Duration::seconds(31));
        }
        assert_eq!(auth.sends_remaining().await, 0);
        assert!(matches!(
            auth.send_code("9876543210").await,
            Err(AuthError::SendBudgetExhausted { max: 5 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_send_failures_are_retried() {
        let (_, _, auth) = setup(2);
        let challenge = auth.send_code("9876543210").await.unwrap();
        assert_eq!(challenge.sends_remaining, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_send_failure_surfaces_and_costs_nothing() {
        let (_, _, auth) = setup(10);
        assert!(matches!(
            auth.send_code("9876543210").await,
            Err(AuthError::Transport(_))
        ));
        assert_eq!(auth.sends_remaining().await, MAX_SENDS);
    }

    #[tokio::test]
    async fn invalid_phone_never_reaches_transport() {
        let (_, _, auth) = setup(0);
        assert!(matches!(
            auth.send_code("12345").await,
            Err(AuthError::InvalidPhone(_))
        ));
        assert_eq!(auth.sends_remaining().await, MAX_SENDS);
    }
}
