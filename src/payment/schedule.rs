//! Training schedule shown on the confirmation screen.
//!
//! Sessions run Monday, Wednesday and Friday. The first one is the Monday
//! after the payment date at 06:00 local time.

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::workflow::{Facility, Plan};

use super::model::PaymentRecord;

/// Sessions listed on the confirmation.
pub const SCHEDULED_SESSIONS: usize = 8;

const SESSION_HOUR: u32 = 6;
const TRAINING_DAYS: [Weekday; 3] = [Weekday::Mon, Weekday::Wed, Weekday::Fri];

/// Everything the confirmation screen displays. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmationData {
    pub session_start: NaiveDateTime,
    pub location: String,
    pub coach_name: String,
    pub coach_phone: String,
    pub sessions: Vec<NaiveDateTime>,
    pub payment_reference: String,
    pub plan_name: String,
    pub amount: Decimal,
    pub currency: String,
}

impl ConfirmationData {
    /// Assemble the confirmation for a verified payment made at `now`.
    pub fn build(
        plan: &Plan,
        facility: &Facility,
        record: &PaymentRecord,
        now: NaiveDateTime,
    ) -> Self {
        let session_start = next_session_start(now);
        Self {
            session_start,
            location: facility.address.clone(),
            coach_name: facility.coach_name.clone(),
            coach_phone: facility.coach_phone.clone(),
            sessions: session_schedule(session_start, SCHEDULED_SESSIONS),
            payment_reference: record.gateway_payment_id().to_string(),
            plan_name: plan.name.clone(),
            amount: record.amount(),
            currency: record.currency().to_string(),
        }
    }
}

/// The Monday strictly after `now`'s date, at 06:00.
///
/// A payment made on a Monday starts the following Monday.
pub fn next_session_start(now: NaiveDateTime) -> NaiveDateTime {
    let today = now.date();
    let days_ahead = match today.weekday().num_days_from_monday() {
        0 => 7,
        n => 7 - n,
    };
    let monday = today + Days::new(u64::from(days_ahead));
    at_session_hour(monday)
}

/// Up to `count` Mon/Wed/Fri sessions starting at `start`, all at `start`'s
/// time of day. A weekend start moves forward to the next Monday.
pub fn session_schedule(start: NaiveDateTime, count: usize) -> Vec<NaiveDateTime> {
    let time = start.time();
    let mut day = start.date();
    while matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
        day = day + Days::new(1);
    }

    let mut sessions = Vec::with_capacity(count);
    while sessions.len() < count {
        if TRAINING_DAYS.contains(&day.weekday()) {
            sessions.push(day.and_time(time));
        }
        day = day + Days::new(1);
    }
    sessions
}

fn at_session_hour(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN) + chrono::Duration::hours(i64::from(SESSION_HOUR))
}
