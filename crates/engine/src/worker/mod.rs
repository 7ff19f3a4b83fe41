//! Worker pool driving the engine
//!
//! - [`WorkerPool`] - bounded queues, concurrent processing, graceful drain
//! - [`BackpressureConfig`] - watermarks on in-flight work
//! - [`PollerConfig`] - runnable-execution polling with adaptive backoff
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         WorkerPool                           │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌────────┐  │
//! │  │  Runnable  │  │ Due waits  │  │ Listener   │  │EventBus│  │
//! │  │  poller    │  │  scanner   │  │  expiry    │  │ stream │  │
//! │  └─────┬──────┘  └─────┬──────┘  └─────┬──────┘  └───┬────┘  │
//! │        ▼               ▼───────────────┘             ▼       │
//! │  [executions]      [due waits]                   [events]    │
//! │        │               │                             │       │
//! │        ▼               ▼                             ▼       │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │      Semaphore-limited processing (BackpressureState)  │  │
//! │  │  run_execution    process_due_wait    handle_event     │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each queue item is processed start to finish under the execution's
//! lease; an execution already queued or running here is not queued again.

mod backpressure;
mod poller;
mod pool;

pub use backpressure::{BackpressureConfig, BackpressureError, BackpressureState};
pub use poller::{AdaptiveInterval, PollerConfig, RunnablePoller};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
