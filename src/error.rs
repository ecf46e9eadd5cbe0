//! Error types for the enrollment flow.

use std::time::Duration;

/// Top-level error type for the enrollment flow.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

/// User-facing error taxonomy.
///
/// Every error the flow can produce folds into one of these buckets, which
/// decides how it is shown and whether "try again" is offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad user input. Shown inline, never retryable.
    Validation,
    /// Transient transport failure.
    Network,
    /// Gateway-reported payment failure. Only retried by the user.
    Payment,
    /// OTP or session failure.
    Auth,
    /// Anything unexpected.
    System,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Network => "network",
            Self::Payment => "payment",
            Self::Auth => "auth",
            Self::System => "system",
        };
        write!(f, "{s}")
    }
}

impl Error {
    /// Classify this error into the user-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::System,
            Self::Storage(_) => ErrorKind::System,
            Self::Auth(AuthError::InvalidPhone(_)) | Self::Auth(AuthError::InvalidCode) => {
                ErrorKind::Validation
            }
            Self::Auth(_) => ErrorKind::Auth,
            Self::Payment(PaymentError::Transport(_)) => ErrorKind::Network,
            Self::Payment(
                PaymentError::MissingPlan | PaymentError::MissingPhone | PaymentError::AlreadyPaid { .. },
            ) => ErrorKind::Validation,
            Self::Payment(_) => ErrorKind::Payment,
            Self::Platform(e) if e.is_retryable() => ErrorKind::Network,
            Self::Platform(_) => ErrorKind::System,
            Self::Workflow(WorkflowError::InconsistentSnapshot(_)) => ErrorKind::System,
            Self::Workflow(_) => ErrorKind::Validation,
        }
    }

    /// Whether offering "try again" to the user makes sense.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::Validation => false,
            ErrorKind::Network | ErrorKind::Payment | ErrorKind::System => true,
            ErrorKind::Auth => !matches!(self, Self::Auth(AuthError::SendBudgetExhausted { .. })),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Storage slot errors.
///
/// These never cross the persistence boundary: the persistence layer logs
/// them and reports a boolean.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage quota exceeded: {needed} bytes needed, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Obfuscation error: {0}")]
    Obfuscation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Phone verification errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid phone number: {0}")]
    InvalidPhone(String),

    #[error("Invalid verification code")]
    InvalidCode,

    #[error("OTP resend available in {wait:?}")]
    Cooldown { wait: Duration },

    #[error("OTP send limit ({max}) reached for this session")]
    SendBudgetExhausted { max: u32 },

    #[error("No OTP has been sent for this session")]
    NoPendingVerification,

    #[error("OTP transport failed: {0}")]
    Transport(String),
}

impl AuthError {
    /// Transport failures on the send step are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Payment verification errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PaymentError {
    #[error("No plan selected")]
    MissingPlan,

    #[error("No verified phone number")]
    MissingPhone,

    #[error("Session already paid with {paid}, refusing {received}")]
    AlreadyPaid { paid: String, received: String },

    #[error("Payment verification rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Payment verification transport failed: {0}")]
    Transport(String),

    #[error("Invalid verification response: {0}")]
    InvalidResponse(String),
}

/// Secondary platform call errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl PlatformError {
    /// Network/timeout errors and HTTP 5xx/429 are retryable; every other
    /// 4xx and malformed responses are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Http { status, .. } => *status == 429 || (500..600).contains(status),
            Self::InvalidResponse(_) => false,
        }
    }
}

/// Workflow misuse errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Cannot proceed to {target}: {blocking} is incomplete")]
    Blocked { target: String, blocking: String },

    #[error("Already at the last step")]
    AtLastStep,

    #[error("Stored snapshot is inconsistent: {0}")]
    InconsistentSnapshot(String),
}

/// Result type alias for the enrollment flow.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_retryability() {
        assert!(PlatformError::Network("reset".into()).is_retryable());
        assert!(PlatformError::Timeout.is_retryable());
        for status in [500, 502, 503, 429] {
            let err = PlatformError::Http {
                status,
                message: String::new(),
            };
            assert!(err.is_retryable(), "{status} should be retryable");
        }
        for status in [400, 401, 403, 404, 409, 422] {
            let err = PlatformError::Http {
                status,
                message: String::new(),
            };
            assert!(!err.is_retryable(), "{status} should not be retryable");
        }
        assert!(!PlatformError::InvalidResponse("bad json".into()).is_retryable());
    }

    #[test]
    fn kinds_follow_taxonomy() {
        let e: Error = AuthError::InvalidPhone("12".into()).into();
        assert_eq!(e.kind(), ErrorKind::Validation);
        assert!(!e.is_retryable());

        let e: Error = PaymentError::Rejected {
            status: 400,
            message: "signature mismatch".into(),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::Payment);
        assert!(e.is_retryable());

        let e: Error = PaymentError::Transport("reset".into()).into();
        assert_eq!(e.kind(), ErrorKind::Network);

        let e: Error = PlatformError::Timeout.into();
        assert_eq!(e.kind(), ErrorKind::Network);

        let e: Error = AuthError::SendBudgetExhausted { max: 5 }.into();
        assert_eq!(e.kind(), ErrorKind::Auth);
        assert!(!e.is_retryable());
    }
}
