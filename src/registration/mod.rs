//! Secondary registration — propagates a paid enrollment to the second
//! system of record with bounded, sequential retries.
//!
//! The [`AttemptLedger`] caps attempts per `(phone, payment)` key and keeps
//! two runs for the same key from overlapping. Platform errors are classified
//! by [`PlatformError::is_retryable`](crate::error::PlatformError::is_retryable);
//! the first non-retryable error ends a run early.

pub mod engine;
pub mod ledger;
pub mod platform;
pub mod retry;

pub use engine::{
    AccountLink, RegistrationEngine, RegistrationOutcome, RegistrationReceipt, RegistrationRequest,
};
pub use ledger::{AttemptLedger, LedgerRefusal, RegistrationKey};
pub use platform::{Credentials, HttpSecondaryPlatform, NewEnrollment, PaymentUpdate, SecondaryPlatform};
pub use retry::{BackoffPolicy, RetryError, retry};
