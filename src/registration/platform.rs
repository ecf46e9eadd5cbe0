//! Secondary platform seam and its HTTP adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::HttpEndpointConfig;
use crate::error::{ConfigError, PlatformError};
use crate::payment::PaymentRecordStatus;

/// Enrollment as created on the secondary platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEnrollment {
    pub phone_number: String,
    pub sport: String,
    pub plan_id: String,
    /// Plan length in months.
    pub plan_duration: u32,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub payment_status: PaymentRecordStatus,
    pub order_id: String,
}

/// Payment details attached to an existing enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentUpdate {
    pub payment_id: String,
    pub status: PaymentRecordStatus,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub paid_at: DateTime<Utc>,
}

/// Login credentials issued by the platform.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub temporary_password: SecretString,
}

/// The second system of record an enrollment is propagated to.
#[async_trait]
pub trait SecondaryPlatform: Send + Sync {
    /// Create the enrollment and return the platform's id for it.
    async fn create_enrollment(&self, enrollment: &NewEnrollment) -> Result<String, PlatformError>;

    async fn update_enrollment_payment(
        &self,
        enrollment_id: &str,
        update: &PaymentUpdate,
    ) -> Result<(), PlatformError>;

    async fn generate_credentials(
        &self,
        phone_number: &str,
        enrollment_id: &str,
    ) -> Result<Credentials, PlatformError>;

    /// Create a login-capable account. Callers treat failure as non-fatal.
    async fn create_account(
        &self,
        phone_number: &str,
        credentials: &Credentials,
    ) -> Result<(), PlatformError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnrollmentCreated {
    enrollment_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsIssued {
    username: String,
    temporary_password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsRequest<'a> {
    phone_number: &'a str,
    enrollment_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountRequest<'a> {
    phone_number: &'a str,
    username: &'a str,
    password: &'a str,
}

/// [`SecondaryPlatform`] over a JSON HTTP API.
///
/// | Operation                   | Request                                  |
/// |-----------------------------|------------------------------------------|
/// | `create_enrollment`         | `POST  /enrollments`                     |
/// | `update_enrollment_payment` | `PATCH /enrollments/{id}/payment`        |
/// | `generate_credentials`      | `POST  /enrollments/{id}/credentials`    |
/// | `create_account`            | `POST  /accounts`                        |
pub struct HttpSecondaryPlatform {
    endpoint: HttpEndpointConfig,
    client: reqwest::Client,
}

impl HttpSecondaryPlatform {
    pub fn new(endpoint: HttpEndpointConfig) -> Result<Self, ConfigError> {
        let client = endpoint.build_client()?;
        Ok(Self { endpoint, client })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, PlatformError> {
        let response = request
            .bearer_auth(self.endpoint.api_key.expose_secret())
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), "Secondary platform returned an error status");
        Err(PlatformError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

/// Map a transport-level failure onto the platform error taxonomy.
fn classify(e: reqwest::Error) -> PlatformError {
    if e.is_timeout() {
        PlatformError::Timeout
    } else if e.is_decode() {
        PlatformError::InvalidResponse(e.to_string())
    } else {
        PlatformError::Network(e.to_string())
    }
}

#[async_trait]
impl SecondaryPlatform for HttpSecondaryPlatform {
    async fn create_enrollment(&self, enrollment: &NewEnrollment) -> Result<String, PlatformError> {
        let response = self
            .send(self.client.post(self.endpoint.url("enrollments")).json(enrollment))
            .await?;
        let body: EnrollmentCreated = response.json().await.map_err(|e| {
            if e.is_timeout() {
                PlatformError::Timeout
            } else {
                PlatformError::InvalidResponse(e.to_string())
            }
        })?;
        Ok(body.enrollment_id)
    }

    async fn update_enrollment_payment(
        &self,
        enrollment_id: &str,
        update: &PaymentUpdate,
    ) -> Result<(), PlatformError> {
        let url = self.endpoint.url(&format!("enrollments/{enrollment_id}/payment"));
        self.send(self.client.patch(url).json(update)).await?;
        Ok(())
    }

    async fn generate_credentials(
        &self,
        phone_number: &str,
        enrollment_id: &str,
    ) -> Result<Credentials, PlatformError> {
        let url = self.endpoint.url(&format!("enrollments/{enrollment_id}/credentials"));
        let body = CredentialsRequest {
            phone_number,
            enrollment_id,
        };
        let response = self.send(self.client.post(url).json(&body)).await?;
        let issued: CredentialsIssued = response
            .json()
            .await
            .map_err(|e| PlatformError::InvalidResponse(e.to_string()))?;
        Ok(Credentials {
            username: issued.username,
            temporary_password: SecretString::from(issued.temporary_password),
        })
    }

    async fn create_account(
        &self,
        phone_number: &str,
        credentials: &Credentials,
    ) -> Result<(), PlatformError> {
        let body = AccountRequest {
            phone_number,
            username: &credentials.username,
            password: credentials.temporary_password.expose_secret(),
        };
        self.send(self.client.post(self.endpoint.url("accounts")).json(&body))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn new_enrollment_wire_shape() {
        let enrollment = NewEnrollment {
            phone_number: "+919876543210".into(),
            sport: "tennis".into(),
            plan_id: "plan_3m".into(),
            plan_duration: 3,
            amount: dec!(4500),
            currency: "INR".into(),
            payment_status: PaymentRecordStatus::Captured,
            order_id: "order_1".into(),
        };
        let value = serde_json::to_value(&enrollment).unwrap();
        assert_eq!(value["phoneNumber"], "+919876543210");
        assert_eq!(value["planDuration"], 3);
        assert_eq!(value["paymentStatus"], "captured");
        assert_eq!(value["orderId"], "order_1");
        assert_eq!(value["amount"], 4500.0);
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials {
            username: "ravi".into(),
            temporary_password: SecretString::from("hunter2"),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
