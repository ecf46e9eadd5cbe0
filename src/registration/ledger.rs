//! Attempt ledger — per-key attempt counters and the in-flight guard.
//!
//! The counter for a key only ever grows, up to `max_attempts`, and drops
//! back to zero on success or an operator reset. Increments happen under a
//! plain mutex before the remote call is issued, so two runs for the same key
//! can never interleave. A key whose run ended on a non-retryable error stays
//! refused until an operator reset.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PlatformError;

/// Idempotency key for one registration: who paid, and for which payment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationKey {
    pub phone_number: String,
    pub payment_id: String,
}

impl RegistrationKey {
    pub fn new(phone_number: impl Into<String>, payment_id: impl Into<String>) -> Self {
        Self {
            phone_number: phone_number.into(),
            payment_id: payment_id.into(),
        }
    }
}

impl fmt::Display for RegistrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.phone_number, self.payment_id)
    }
}

/// Why the ledger refused to start a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerRefusal {
    /// Another run for this key has not finished yet.
    InFlight,
    /// The key has already used its whole budget.
    Exhausted { attempts: u32 },
    /// An earlier run was rejected by the platform.
    Rejected { error: PlatformError, attempts: u32 },
}

#[derive(Default)]
struct LedgerInner {
    attempts: HashMap<RegistrationKey, u32>,
    in_flight: HashSet<RegistrationKey>,
    rejected: HashMap<RegistrationKey, PlatformError>,
}

/// Shared attempt bookkeeping for every registration key.
pub struct AttemptLedger {
    max_attempts: u32,
    inner: Mutex<LedgerInner>,
}

impl AttemptLedger {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        // The map stays consistent even if a holder panicked mid-update.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attempts used so far for `key`.
    pub fn attempts(&self, key: &RegistrationKey) -> u32 {
        self.lock().attempts.get(key).copied().unwrap_or(0)
    }

    /// Attempts still available for `key`.
    pub fn remaining(&self, key: &RegistrationKey) -> u32 {
        self.max_attempts.saturating_sub(self.attempts(key))
    }

    /// Whether a run for `key` is in progress.
    pub fn is_in_flight(&self, key: &RegistrationKey) -> bool {
        self.lock().in_flight.contains(key)
    }

    /// Claim `key` for one run.
    ///
    /// The claim is released when the returned guard drops.
    pub fn begin(self: &Arc<Self>, key: &RegistrationKey) -> Result<RunGuard, LedgerRefusal> {
        let mut inner = self.lock();
        if inner.in_flight.contains(key) {
            debug!(key = %key, "Registration already in flight");
            return Err(LedgerRefusal::InFlight);
        }
        let attempts = inner.attempts.get(key).copied().unwrap_or(0);
        if let Some(error) = inner.rejected.get(key) {
            return Err(LedgerRefusal::Rejected {
                error: error.clone(),
                attempts,
            });
        }
        if attempts >= self.max_attempts {
            return Err(LedgerRefusal::Exhausted { attempts });
        }
        inner.in_flight.insert(key.clone());
        Ok(RunGuard {
            ledger: Arc::clone(self),
            key: key.clone(),
        })
    }

    /// Count one more attempt for `key`, returning the new count.
    ///
    /// Returns `None` without counting once the budget is spent.
    pub fn record_attempt(&self, key: &RegistrationKey) -> Option<u32> {
        let mut inner = self.lock();
        let count = inner.attempts.entry(key.clone()).or_insert(0);
        if *count >= self.max_attempts {
            return None;
        }
        *count += 1;
        Some(*count)
    }

    /// Forget the count for `key` after a successful run.
    pub fn succeed(&self, key: &RegistrationKey) {
        self.lock().attempts.remove(key);
    }

    /// Refuse further runs for `key` until an operator reset.
    pub fn reject(&self, key: &RegistrationKey, error: PlatformError) {
        self.lock().rejected.insert(key.clone(), error);
    }

    /// Whether `key` is parked after a non-retryable error.
    pub fn is_rejected(&self, key: &RegistrationKey) -> bool {
        self.lock().rejected.contains_key(key)
    }

    /// Operator reset: give `key` a fresh budget. Returns the old count.
    pub fn reset(&self, key: &RegistrationKey) -> u32 {
        let previous = {
            let mut inner = self.lock();
            inner.rejected.remove(key);
            inner.attempts.remove(key).unwrap_or(0)
        };
        info!(key = %key, previous, "Registration attempts reset");
        previous
    }

    fn release(&self, key: &RegistrationKey) {
        self.lock().in_flight.remove(key);
    }
}

/// Holds a key's in-flight claim for the duration of one run.
pub struct RunGuard {
    ledger: Arc<AttemptLedger>,
    key: RegistrationKey,
}

impl RunGuard {
    pub fn key(&self) -> &RegistrationKey {
        &self.key
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.ledger.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RegistrationKey {
        RegistrationKey::new("+919876543210", "pay_1")
    }

    #[test]
    fn key_display() {
        assert_eq!(key().to_string(), "+919876543210:pay_1");
    }

    #[test]
    fn counter_is_bounded() {
        let ledger = AttemptLedger::new(3);
        for expected in 1..=3 {
            assert_eq!(ledger.record_attempt(&key()), Some(expected));
        }
        for _ in 0..10 {
            assert_eq!(ledger.record_attempt(&key()), None);
            assert_eq!(ledger.attempts(&key()), 3);
        }
        assert_eq!(ledger.remaining(&key()), 0);
    }

    #[test]
    fn second_run_is_refused_while_first_holds_the_key() {
        let ledger = Arc::new(AttemptLedger::new(3));
        let guard = ledger.begin(&key()).unwrap();
        assert!(ledger.is_in_flight(&key()));
        assert_eq!(ledger.begin(&key()).err(), Some(LedgerRefusal::InFlight));

        // Other keys are independent.
        let other = RegistrationKey::new("+919876543210", "pay_2");
        assert!(ledger.begin(&other).is_ok());

        drop(guard);
        assert!(!ledger.is_in_flight(&key()));
        assert!(ledger.begin(&key()).is_ok());
    }

    #[test]
    fn spent_budget_is_refused_until_reset() {
        let ledger = Arc::new(AttemptLedger::new(2));
        ledger.record_attempt(&key());
        ledger.record_attempt(&key());
        assert_eq!(
            ledger.begin(&key()).err(),
            Some(LedgerRefusal::Exhausted { attempts: 2 })
        );

        assert_eq!(ledger.reset(&key()), 2);
        assert_eq!(ledger.attempts(&key()), 0);
        assert!(ledger.begin(&key()).is_ok());
    }

    #[test]
    fn rejected_key_is_refused_until_reset() {
        let ledger = Arc::new(AttemptLedger::new(3));
        ledger.record_attempt(&key());
        ledger.reject(&key(), PlatformError::Http {
            status: 400,
            message: "unknown plan".into(),
        });
        assert!(ledger.is_rejected(&key()));
        assert!(matches!(
            ledger.begin(&key()).err(),
            Some(LedgerRefusal::Rejected {
                error: PlatformError::Http { status: 400, .. },
                attempts: 1
            })
        ));

        assert_eq!(ledger.reset(&key()), 1);
        assert!(!ledger.is_rejected(&key()));
        assert!(ledger.begin(&key()).is_ok());
    }

    #[test]
    fn success_clears_counter() {
        let ledger = AttemptLedger::new(3);
        ledger.record_attempt(&key());
        ledger.record_attempt(&key());
        ledger.succeed(&key());
        assert_eq!(ledger.attempts(&key()), 0);
    }
}
