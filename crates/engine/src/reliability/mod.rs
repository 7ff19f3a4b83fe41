//! Retry and timeout policies applied while stepping executions

mod retry;
mod timeout;

pub use retry::RetryPolicy;
pub use timeout::{TimeoutConfig, TimeoutError};
