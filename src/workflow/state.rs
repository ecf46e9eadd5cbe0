//! Workflow state — the steps, the live state, and the patch type every
//! mutation goes through.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

use crate::payment::PaymentRecord;

/// The steps of the enrollment flow.
///
/// Progresses linearly: Auth → Facility → Pricing → Payment → Confirmation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    #[default]
    Auth,
    Facility,
    Pricing,
    Payment,
    Confirmation,
}

impl Step {
    /// All steps in flow order.
    pub const ALL: [Step; 5] = [
        Step::Auth,
        Step::Facility,
        Step::Pricing,
        Step::Payment,
        Step::Confirmation,
    ];

    /// Position in the flow, starting at 0.
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Get the next step in the linear progression, if any.
    pub fn next(&self) -> Option<Step> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Steps strictly before this one.
    pub fn predecessors(&self) -> &'static [Step] {
        &Self::ALL[..self.index()]
    }

    /// Whether this step's completion predicate holds for `state`.
    ///
    /// This is the only definition of step completion; everything that needs
    /// it calls through here.
    pub fn is_complete(&self, state: &WorkflowState) -> bool {
        match self {
            Self::Auth | Self::Facility => state.is_authenticated,
            Self::Pricing => state.selected_plan.is_some(),
            Self::Payment => state.payment_status == PaymentStatus::Success,
            Self::Confirmation => {
                state.payment_status == PaymentStatus::Success
                    && state
                        .enrollment_record
                        .as_ref()
                        .is_some_and(|r| r.id.is_some())
            }
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auth => "auth",
            Self::Facility => "facility",
            Self::Pricing => "pricing",
            Self::Payment => "payment",
            Self::Confirmation => "confirmation",
        };
        write!(f, "{s}")
    }
}

/// Payment progress as seen by the flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Processing,
    Success,
    Failed,
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A purchasable plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub sport: String,
    pub duration_months: u32,
    pub price: Decimal,
    pub currency: String,
}

/// Where sessions take place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    pub name: String,
    pub address: String,
    pub coach_name: String,
    pub coach_phone: String,
}

impl Default for Facility {
    fn default() -> Self {
        Self {
            name: "Main Arena".to_string(),
            address: "To be confirmed".to_string(),
            coach_name: "Head Coach".to_string(),
            coach_phone: String::new(),
        }
    }
}

/// Enrollment draft; `id` is assigned once payment verification succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub phone_number: String,
    pub sport: String,
    pub plan_id: String,
    pub created_at: DateTime<Utc>,
}

/// The live state of one enrollment session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub current_step: Step,
    pub phone_number: Option<String>,
    pub is_authenticated: bool,
    pub facility: Option<Facility>,
    pub selected_plan: Option<Plan>,
    pub payment_status: PaymentStatus,
    pub enrollment_record: Option<EnrollmentRecord>,
    pub payment_record: Option<PaymentRecord>,
    pub errors_by_step: BTreeMap<Step, String>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            current_step: Step::Auth,
            phone_number: None,
            is_authenticated: false,
            facility: None,
            selected_plan: None,
            payment_status: PaymentStatus::Pending,
            enrollment_record: None,
            payment_record: None,
            errors_by_step: BTreeMap::new(),
        }
    }
}

impl WorkflowState {
    /// Shallow merge: every field present in the patch overwrites the
    /// matching field wholesale. Nested values are never deep-merged.
    pub fn apply(&mut self, patch: StatePatch) {
        if let Some(step) = patch.current_step {
            self.current_step = step;
        }
        if let Some(phone) = patch.phone_number {
            self.phone_number = phone;
        }
        if let Some(auth) = patch.is_authenticated {
            self.is_authenticated = auth;
        }
        if let Some(facility) = patch.facility {
            self.facility = facility;
        }
        if let Some(plan) = patch.selected_plan {
            self.selected_plan = plan;
        }
        if let Some(status) = patch.payment_status {
            self.payment_status = status;
        }
        if let Some(record) = patch.enrollment_record {
            self.enrollment_record = record;
        }
        if let Some(record) = patch.payment_record {
            self.payment_record = record;
        }
        if let Some(errors) = patch.errors_by_step {
            self.errors_by_step = errors;
        }
    }

    /// The subset of state worth persisting.
    ///
    /// Validation errors are dropped so a resumed session starts clean, and
    /// an in-flight `Processing` payment is stored as `Pending` since the
    /// gateway round trip cannot survive a reload.
    pub fn to_persistable(&self) -> StatePatch {
        let payment_status = match self.payment_status {
            PaymentStatus::Processing => PaymentStatus::Pending,
            other => other,
        };
        StatePatch {
            current_step: Some(self.current_step),
            phone_number: Some(self.phone_number.clone()),
            is_authenticated: Some(self.is_authenticated),
            facility: Some(self.facility.clone()),
            selected_plan: Some(self.selected_plan.clone()),
            payment_status: Some(payment_status),
            enrollment_record: Some(self.enrollment_record.clone()),
            payment_record: Some(self.payment_record.clone()),
            errors_by_step: None,
        }
    }
}

/// A partial `WorkflowState`.
///
/// `None` leaves a field alone. For nullable fields `Some(None)` clears the
/// field; in JSON that is an explicit `null`, while an absent key is `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<Step>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_authenticated: Option<bool>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub facility: Option<Option<Facility>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub selected_plan: Option<Option<Plan>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<PaymentStatus>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub enrollment_record: Option<Option<EnrollmentRecord>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub payment_record: Option<Option<PaymentRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors_by_step: Option<BTreeMap<Step, String>>,
}

/// A present key (even `null`) deserializes to `Some(..)`.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: Step) -> Self {
        self.current_step = Some(step);
        self
    }

    pub fn phone(mut self, phone: impl Into<String>) -> Self {
        self.phone_number = Some(Some(phone.into()));
        self
    }

    pub fn authenticated(mut self, value: bool) -> Self {
        self.is_authenticated = Some(value);
        self
    }

    pub fn facility(mut self, facility: Facility) -> Self {
        self.facility = Some(Some(facility));
        self
    }

    pub fn plan(mut self, plan: Plan) -> Self {
        self.selected_plan = Some(Some(plan));
        self
    }

    pub fn clear_plan(mut self) -> Self {
        self.selected_plan = Some(None);
        self
    }

    pub fn payment_status(mut self, status: PaymentStatus) -> Self {
        self.payment_status = Some(status);
        self
    }

    pub fn enrollment(mut self, record: EnrollmentRecord) -> Self {
        self.enrollment_record = Some(Some(record));
        self
    }

    pub fn clear_enrollment(mut self) -> Self {
        self.enrollment_record = Some(None);
        self
    }

    pub fn payment_record(mut self, record: PaymentRecord) -> Self {
        self.payment_record = Some(Some(record));
        self
    }

    pub fn errors(mut self, errors: BTreeMap<Step, String>) -> Self {
        self.errors_by_step = Some(errors);
        self
    }

    /// Whether the patch touches nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
