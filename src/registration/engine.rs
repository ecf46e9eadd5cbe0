//! RegistrationEngine — propagates a paid enrollment to the secondary
//! platform under the attempt ledger's budget.
//!
//! Each attempt runs the whole sequence again:
//!
//! ```text
//! create_enrollment → update_enrollment_payment → generate_credentials
//!                   → create_account (best effort) → record account link
//! ```
//!
//! Delivery is at-least-once; the platform deduplicates on the
//! `(phone, payment)` key. Once a key has registered, later calls return the
//! stored receipt without touching the platform.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::RegistrationConfig;
use crate::error::PlatformError;
use crate::payment::{PaymentRecord, PaymentRecordStatus};
use crate::store::Storage;
use crate::workflow::Plan;

use super::ledger::{AttemptLedger, LedgerRefusal, RegistrationKey};
use super::platform::{Credentials, NewEnrollment, PaymentUpdate, SecondaryPlatform};
use super::retry::{BackoffPolicy, RetryError, retry};

/// Everything the platform needs to know about one paid enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub phone_number: String,
    pub sport: String,
    pub plan_id: String,
    pub plan_duration_months: u32,
    pub amount: Decimal,
    pub currency: String,
    pub order_id: String,
    pub payment_id: String,
    pub paid_at: DateTime<Utc>,
}

impl RegistrationRequest {
    pub fn new(phone_number: impl Into<String>, plan: &Plan, record: &PaymentRecord) -> Self {
        Self {
            phone_number: phone_number.into(),
            sport: plan.sport.clone(),
            plan_id: plan.id.clone(),
            plan_duration_months: plan.duration_months,
            amount: record.amount(),
            currency: record.currency().to_string(),
            order_id: record.gateway_order_id().to_string(),
            payment_id: record.gateway_payment_id().to_string(),
            paid_at: record.created_at(),
        }
    }

    pub fn key(&self) -> RegistrationKey {
        RegistrationKey::new(&self.phone_number, &self.payment_id)
    }
}

/// A successful registration.
#[derive(Debug, Clone)]
pub struct RegistrationReceipt {
    pub platform_enrollment_id: String,
    pub credentials: Credentials,
    /// False when the best-effort account creation failed.
    pub account_created: bool,
    /// Which attempt succeeded (1-indexed, counted per key).
    pub attempts: u32,
}

/// Result of [`RegistrationEngine::register`].
#[derive(Debug, Clone)]
pub enum RegistrationOutcome {
    Registered(RegistrationReceipt),
    /// Stopped on a non-retryable error. The key stays refused until an
    /// operator reset.
    Rejected { error: PlatformError, attempts: u32 },
    /// The key's whole attempt budget is spent. `last_error` is `None` when
    /// the budget was already gone before this call.
    Exhausted {
        last_error: Option<PlatformError>,
        attempts: u32,
    },
    /// Another run for the same key has not finished.
    InFlight,
}

impl RegistrationOutcome {
    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Registered(_))
    }

    /// Whether the UI should offer an automatic retry.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::InFlight)
    }

    /// Whether only support can move this key forward.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::Exhausted { .. })
    }

    pub fn error(&self) -> Option<&PlatformError> {
        match self {
            Self::Rejected { error, .. } => Some(error),
            Self::Exhausted { last_error, .. } => last_error.as_ref(),
            _ => None,
        }
    }
}

/// Local record linking a phone number to its platform account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLink {
    pub phone_number: String,
    pub platform_enrollment_id: String,
    pub username: String,
    pub account_created: bool,
    pub linked_at: DateTime<Utc>,
}

/// Runs registrations against the secondary platform.
pub struct RegistrationEngine {
    platform: Arc<dyn SecondaryPlatform>,
    storage: Arc<dyn Storage>,
    ledger: Arc<AttemptLedger>,
    clock: Arc<dyn Clock>,
    policy: BackoffPolicy,
    registered: Mutex<HashMap<RegistrationKey, RegistrationReceipt>>,
    links_key: String,
    links_lock: Mutex<()>,
}

impl RegistrationEngine {
    pub fn new(
        platform: Arc<dyn SecondaryPlatform>,
        storage: Arc<dyn Storage>,
        ledger: Arc<AttemptLedger>,
        clock: Arc<dyn Clock>,
        config: &RegistrationConfig,
        storage_key: &str,
    ) -> Self {
        Self {
            platform,
            storage,
            ledger,
            clock,
            policy: BackoffPolicy::from_config(config),
            registered: Mutex::new(HashMap::new()),
            links_key: format!("{storage_key}:account_links"),
            links_lock: Mutex::new(()),
        }
    }

    pub fn ledger(&self) -> &Arc<AttemptLedger> {
        &self.ledger
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Register `request`, retrying transient failures with backoff.
    ///
    /// Never returns an error: every failure is folded into the outcome.
    pub async fn register(&self, request: &RegistrationRequest) -> RegistrationOutcome {
        let key = request.key();
        if let Some(receipt) = self.registered.lock().await.get(&key) {
            debug!(key = %key, "Registration already completed");
            return RegistrationOutcome::Registered(receipt.clone());
        }
        let _run = match self.ledger.begin(&key) {
            Ok(run) => run,
            Err(LedgerRefusal::InFlight) => return RegistrationOutcome::InFlight,
            Err(LedgerRefusal::Rejected { error, attempts }) => {
                warn!(key = %key, attempts, "Registration was rejected earlier: {}", error);
                return RegistrationOutcome::Rejected { error, attempts };
            }
            Err(LedgerRefusal::Exhausted { attempts }) => {
                warn!(key = %key, attempts, "Registration budget already spent");
                return RegistrationOutcome::Exhausted {
                    last_error: None,
                    attempts,
                };
            }
        };

        let first = self.ledger.attempts(&key) + 1;
        let last = self.ledger.max_attempts();
        let result = retry(first..=last, &self.policy, PlatformError::is_retryable, |attempt| {
            // Counted before the request goes out.
            self.ledger.record_attempt(&key);
            info!(key = %key, attempt, "Registration attempt");
            self.attempt(request, attempt)
        })
        .await;

        match result {
            Ok(receipt) => {
                self.ledger.succeed(&key);
                self.registered.lock().await.insert(key.clone(), receipt.clone());
                info!(
                    key = %key,
                    attempts = receipt.attempts,
                    enrollment_id = %receipt.platform_enrollment_id,
                    "Registration succeeded"
                );
                RegistrationOutcome::Registered(receipt)
            }
            Err(RetryError::NonRetryable { error, attempts }) => {
                error!(key = %key, attempts, "Registration rejected: {}", error);
                self.ledger.reject(&key, error.clone());
                RegistrationOutcome::Rejected { error, attempts }
            }
            Err(RetryError::Exhausted { error, attempts }) => {
                error!(key = %key, attempts, "Registration attempts exhausted: {}", error);
                RegistrationOutcome::Exhausted {
                    last_error: Some(error),
                    attempts,
                }
            }
            Err(RetryError::NoAttemptsLeft) => RegistrationOutcome::Exhausted {
                last_error: None,
                attempts: self.ledger.attempts(&key),
            },
        }
    }

    async fn attempt(
        &self,
        request: &RegistrationRequest,
        attempt: u32,
    ) -> Result<RegistrationReceipt, PlatformError> {
        let enrollment_id = self
            .platform
            .create_enrollment(&NewEnrollment {
                phone_number: request.phone_number.clone(),
                sport: request.sport.clone(),
                plan_id: request.plan_id.clone(),
                plan_duration: request.plan_duration_months,
                amount: request.amount,
                currency: request.currency.clone(),
                payment_status: PaymentRecordStatus::Captured,
                order_id: request.order_id.clone(),
            })
            .await?;

        self.platform
            .update_enrollment_payment(
                &enrollment_id,
                &PaymentUpdate {
                    payment_id: request.payment_id.clone(),
                    status: PaymentRecordStatus::Captured,
                    amount: request.amount,
                    paid_at: request.paid_at,
                },
            )
            .await?;

        let credentials = self
            .platform
            .generate_credentials(&request.phone_number, &enrollment_id)
            .await?;

        let account_created = match self
            .platform
            .create_account(&request.phone_number, &credentials)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(enrollment_id = %enrollment_id, "Account creation failed, continuing: {}", e);
                false
            }
        };

        self.record_link(AccountLink {
            phone_number: request.phone_number.clone(),
            platform_enrollment_id: enrollment_id.clone(),
            username: credentials.username.clone(),
            account_created,
            linked_at: self.clock.now(),
        })
        .await;

        Ok(RegistrationReceipt {
            platform_enrollment_id: enrollment_id,
            credentials,
            account_created,
            attempts: attempt,
        })
    }

    /// Every account link recorded so far. Unreadable logs read as empty.
    pub async fn account_links(&self) -> Vec<AccountLink> {
        match self.storage.get(&self.links_key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Discarding unreadable account link log: {}", e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to read account link log: {}", e);
                Vec::new()
            }
        }
    }

    async fn record_link(&self, link: AccountLink) {
        let _guard = self.links_lock.lock().await;
        let mut links = self.account_links().await;
        links.push(link);
        let raw = match serde_json::to_string(&links) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to serialize account link log: {}", e);
                return;
            }
        };
        if let Err(e) = self.storage.set(&self.links_key, &raw).await {
            warn!("Failed to write account link log: {}", e);
        }
    }
}
