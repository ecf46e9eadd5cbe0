//! Payment data model — gateway callback, verification wire types, and the
//! durable payment record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a payment as recorded locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentRecordStatus {
    Created,
    Authorized,
    Captured,
    Failed,
}

impl std::fmt::Display for PaymentRecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Authorized => "authorized",
            Self::Captured => "captured",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Payload the payment widget hands back after checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCallback {
    #[serde(rename = "razorpay_order_id")]
    pub order_id: String,
    #[serde(rename = "razorpay_payment_id")]
    pub payment_id: String,
    #[serde(rename = "razorpay_signature")]
    pub signature: String,
}

/// Enrollment details sent along with a verification request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationEnrollment {
    pub phone_number: String,
    pub sport: String,
    pub plan_id: String,
}

/// Body of the outbound verification call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub order_id: String,
    pub payment_id: String,
    pub signature: String,
    #[serde(rename = "enrollmentData")]
    pub enrollment_data: VerificationEnrollment,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
}

/// Verification endpoint response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResponse {
    pub success: bool,
    #[serde(default)]
    pub enrollment_id: Option<String>,
    #[serde(default)]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A verified payment. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    id: Uuid,
    enrollment_id: String,
    gateway_order_id: String,
    gateway_payment_id: String,
    amount: Decimal,
    currency: String,
    status: PaymentRecordStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    /// Record a captured payment.
    pub fn captured(
        enrollment_id: impl Into<String>,
        callback: &GatewayCallback,
        amount: Decimal,
        currency: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            enrollment_id: enrollment_id.into(),
            gateway_order_id: callback.order_id.clone(),
            gateway_payment_id: callback.payment_id.clone(),
            amount,
            currency: currency.into(),
            status: PaymentRecordStatus::Captured,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn enrollment_id(&self) -> &str {
        &self.enrollment_id
    }

    pub fn gateway_order_id(&self) -> &str {
        &self.gateway_order_id
    }

    pub fn gateway_payment_id(&self) -> &str {
        &self.gateway_payment_id
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn status(&self) -> PaymentRecordStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn callback_uses_gateway_field_names() {
        let raw = r#"{
            "razorpay_order_id": "order_1",
            "razorpay_payment_id": "pay_1",
            "razorpay_signature": "sig"
        }"#;
        let cb: GatewayCallback = serde_json::from_str(raw).unwrap();
        assert_eq!(cb.order_id, "order_1");
        assert_eq!(cb.payment_id, "pay_1");
        assert_eq!(cb.signature, "sig");
    }

    #[test]
    fn verification_request_wire_shape() {
        let req = VerificationRequest {
            order_id: "order_1".into(),
            payment_id: "pay_1".into(),
            signature: "sig".into(),
            enrollment_data: VerificationEnrollment {
                phone_number: "+919876543210".into(),
                sport: "swimming".into(),
                plan_id: "plan_3m".into(),
            },
            amount: dec!(4500),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["order_id"], "order_1");
        assert_eq!(value["enrollmentData"]["phoneNumber"], "+919876543210");
        assert_eq!(value["enrollmentData"]["planId"], "plan_3m");
        assert_eq!(value["amount"], 4500.0);
    }

    #[test]
    fn verification_response_tolerates_missing_fields() {
        let resp: VerificationResponse = serde_json::from_str(r#"{"success":false}"#).unwrap();
        assert!(!resp.success);
        assert!(resp.enrollment_id.is_none());
    }

    #[test]
    fn captured_record_copies_gateway_ids() {
        let cb = GatewayCallback {
            order_id: "order_1".into(),
            payment_id: "pay_1".into(),
            signature: "sig".into(),
        };
        let now = Utc::now();
        let record = PaymentRecord::captured("enr_1", &cb, dec!(4500), "INR", now);
        assert_eq!(record.status(), PaymentRecordStatus::Captured);
        assert_eq!(record.gateway_order_id(), "order_1");
        assert_eq!(record.gateway_payment_id(), "pay_1");
        assert_eq!(record.enrollment_id(), "enr_1");
        assert_eq!(record.created_at(), record.updated_at());
    }
}
