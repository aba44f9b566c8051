//! ---
//! mtr_section: "07-resilience-fault-tolerance"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Bounded retry policy."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Retry primitive used wherever the hub talks to flaky hardware.

pub mod retry;

pub use retry::{AttemptFuture, RetryExhausted, RetryPolicy, Succeeded};
