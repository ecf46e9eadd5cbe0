//! Enrollment flow — resumable multi-step checkout with best-effort
//! secondary registration.

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod flow;
pub mod payment;
pub mod persistence;
pub mod recovery;
pub mod registration;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod workflow;

pub use error::{Error, ErrorKind, Result};
pub use flow::{EnrollmentFlow, FlowDeps};
