//! Execution engine
//!
//! - [`Enroller`] - creates executions after checking preconditions
//! - [`Stepper`] - claims an execution and advances it node by node
//! - [`WorkflowEngine`] - the facade the worker pool and API layer call

mod enrollment;
mod error;
mod service;
mod stepper;

pub use enrollment::{EnrollRequest, Enroller};
pub use error::{EngineError, ErrorKind};
pub use service::{EventOutcome, ExecutionReport, WorkflowEngine};
pub use stepper::{ClaimedExecution, ExecutionOutcome, Stepper};
