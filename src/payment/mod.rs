//! Payment confirmation — verifies a gateway callback, records the payment,
//! derives the confirmation and hands off to secondary registration.

pub mod model;
pub mod pipeline;
pub mod schedule;
pub mod verifier;

pub use model::{
    GatewayCallback, PaymentRecord, PaymentRecordStatus, VerificationEnrollment,
    VerificationRequest, VerificationResponse,
};
pub use pipeline::{ConfirmationOutcome, ConfirmationPipeline};
pub use schedule::{ConfirmationData, next_session_start, session_schedule};
pub use verifier::{HttpPaymentVerifier, PaymentVerifier, VerifiedPayment};
