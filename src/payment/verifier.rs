//! Payment verification seam and its HTTP adapter.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::config::HttpEndpointConfig;
use crate::error::{ConfigError, PaymentError};

use super::model::{VerificationRequest, VerificationResponse};

/// What a successful verification hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPayment {
    /// Enrollment id minted by the verification backend.
    pub enrollment_id: String,
    pub payment_id: String,
}

/// Confirms a gateway callback with the backend that owns the signing key.
#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    async fn verify(&self, request: &VerificationRequest) -> Result<VerifiedPayment, PaymentError>;
}

/// [`PaymentVerifier`] that POSTs to `{base_url}/verify-payment`.
pub struct HttpPaymentVerifier {
    endpoint: HttpEndpointConfig,
    client: reqwest::Client,
}

impl HttpPaymentVerifier {
    pub fn new(endpoint: HttpEndpointConfig) -> Result<Self, ConfigError> {
        let client = endpoint.build_client()?;
        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl PaymentVerifier for HttpPaymentVerifier {
    async fn verify(&self, request: &VerificationRequest) -> Result<VerifiedPayment, PaymentError> {
        let response = self
            .client
            .post(self.endpoint.url("verify-payment"))
            .bearer_auth(self.endpoint.api_key.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(|e| PaymentError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PaymentError::Transport(e.to_string()))?;

        if !status.is_success() {
            // Prefer the backend's own error message when it sent one.
            let message = serde_json::from_str::<VerificationResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or(body);
            warn!(status = status.as_u16(), order_id = %request.order_id, "Payment verification rejected");
            return Err(PaymentError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: VerificationResponse =
            serde_json::from_str(&body).map_err(|e| PaymentError::InvalidResponse(e.to_string()))?;
        interpret(status.as_u16(), parsed, &request.payment_id)
    }
}

/// Turn a 2xx verification body into a verdict.
fn interpret(
    status: u16,
    response: VerificationResponse,
    requested_payment_id: &str,
) -> Result<VerifiedPayment, PaymentError> {
    if !response.success {
        return Err(PaymentError::Rejected {
            status,
            message: response
                .error
                .unwrap_or_else(|| "Payment verification failed".to_string()),
        });
    }
    let enrollment_id = response.enrollment_id.ok_or_else(|| {
        PaymentError::InvalidResponse("success without an enrollment id".to_string())
    })?;
    debug!(enrollment_id = %enrollment_id, "Payment verified");
    Ok(VerifiedPayment {
        enrollment_id,
        payment_id: response
            .payment_id
            .unwrap_or_else(|| requested_payment_id.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(success: bool, enrollment_id: Option<&str>, error: Option<&str>) -> VerificationResponse {
        VerificationResponse {
            success,
            enrollment_id: enrollment_id.map(String::from),
            payment_id: None,
            error: error.map(String::from),
        }
    }

    #[test]
    fn success_yields_enrollment_id() {
        let verified = interpret(200, response(true, Some("enr_9"), None), "pay_1").unwrap();
        assert_eq!(verified.enrollment_id, "enr_9");
        assert_eq!(verified.payment_id, "pay_1");
    }

    #[test]
    fn explicit_failure_is_rejection() {
        let err = interpret(200, response(false, None, Some("signature mismatch")), "pay_1").unwrap_err();
        assert!(matches!(err, PaymentError::Rejected { status: 200, ref message } if message == "signature mismatch"));
    }

    #[test]
    fn success_without_id_is_invalid() {
        let err = interpret(200, response(true, None, None), "pay_1").unwrap_err();
        assert!(matches!(err, PaymentError::InvalidResponse(_)));
    }
}
