//! # Workflow Execution Engine
//!
//! Drives contacts through marketing-automation workflow graphs.
//!
//! ## Features
//!
//! - **Lease-based stepping**: one owner advances an execution at a time; expired leases are taken over
//! - **Bounded action retries**: exponential backoff with jitter, classified dispatch failures
//! - **Deterministic branching**: condition evaluation and hash-based split tests
//! - **Waits**: time-based and event-based resumption with compare-and-set race resolution
//! - **Goals**: early exit on goal events or state, recorded at most once per contact
//! - **Bulk enrollment**: large selections processed in independently retryable batches
//! - **Versioning**: publishing new versions and migrating in-flight executions between them
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                          │
//! │  (enrollment, stepping, events, bulk jobs, migrations)      │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                      │
//!          ▼                                      ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────┐
//! │         EngineStore           │  │      Collaborators        │
//! │ (PostgreSQL or in-memory)     │  │ (definitions, contacts,   │
//! │                               │  │  dispatcher, event bus)   │
//! └──────────────────────────────┘  └──────────────────────────┘
//!                              ▲
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerPool                              │
//! │  (scans runnable executions, due waits and expired          │
//! │   listeners; consumes inbound events)                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use automation_engine::prelude::*;
//!
//! let store = Arc::new(InMemoryEngineStore::new());
//! let definitions = Arc::new(VersionDefinitionStore::new(store.clone()));
//! let engine = WorkflowEngine::new(store, definitions, contacts, dispatcher, EngineConfig::default());
//!
//! let execution = engine
//!     .enroll(EnrollRequest::new(workflow_id, contact_id, EnrollmentSource::Api))
//!     .await?;
//! engine.run_execution(execution.id).await?;
//! ```

pub mod bulk;
pub mod collaborators;
pub mod condition;
pub mod config;
pub mod contact;
pub mod criteria;
pub mod definition;
pub mod definitions;
pub mod engine;
pub mod events;
pub mod goal;
pub mod migration;
pub mod model;
pub mod persistence;
pub mod reliability;
pub mod scheduler;
pub mod testing;
pub mod worker;

mod serde_util;

/// Prelude for common imports
pub mod prelude {
    pub use crate::collaborators::{
        ActionDispatcher, CollaboratorError, ContactStore, DefinitionStore, DispatchContext,
        DispatchError, DispatchResult, EventBus,
    };
    pub use crate::config::EngineConfig;
    pub use crate::contact::ContactSnapshot;
    pub use crate::definition::{Node, NodeKind, WorkflowDefinition};
    pub use crate::definitions::VersionDefinitionStore;
    pub use crate::engine::{EngineError, EnrollRequest, ErrorKind, ExecutionOutcome, WorkflowEngine};
    pub use crate::events::InboundEvent;
    pub use crate::model::{EnrollmentSource, ExecutionStatus, WorkflowExecution};
    pub use crate::persistence::{EngineStore, InMemoryEngineStore, PostgresEngineStore, StoreError};
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
}

// Re-export key types at crate root
pub use collaborators::{ActionDispatcher, CollaboratorError, ContactStore, DefinitionStore, EventBus};
pub use config::EngineConfig;
pub use definitions::VersionDefinitionStore;
pub use engine::{EngineError, EnrollRequest, ErrorKind, ExecutionOutcome, WorkflowEngine};
pub use events::InboundEvent;
pub use persistence::{EngineStore, InMemoryEngineStore, PostgresEngineStore, StoreError};
pub use reliability::RetryPolicy;
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
