//! Enrollment workflow — steps, live state, and the machine that mutates it.
//!
//! The flow is linear: auth → facility → pricing → payment → confirmation.
//! All mutation goes through [`WorkflowMachine::update`], which also drives
//! debounced persistence.

pub mod machine;
pub mod state;

pub use machine::{WorkflowMachine, can_proceed, first_blocking};
pub use state::{
    EnrollmentRecord, Facility, PaymentStatus, Plan, StatePatch, Step, WorkflowState,
};
