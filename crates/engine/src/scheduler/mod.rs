//! Scheduling: wait resumption and trigger matching
//!
//! - [`WaitScheduler`] - time and event waits, listener expiry, manual resume
//! - [`TriggerMatcher`] - which workflows an inbound event enrolls a contact into

pub mod trigger;
mod waits;

pub use trigger::{TriggerError, TriggerMatcher};
pub use waits::WaitScheduler;
