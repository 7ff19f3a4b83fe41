//! Engine error taxonomy

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::collaborators::CollaboratorError;
use crate::definition::{DefinitionError, NodeId};
use crate::model::{BatchStatus, BulkJobStatus, ExecutionStatus, MigrationStatus};
use crate::persistence::StoreError;
use crate::scheduler::TriggerError;

/// How the caller should treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Terminates the execution immediately; never retried
    Precondition,
    /// Retry with backoff
    Transient,
    /// Back off and retry the claim later; the entity is not failed
    Concurrency,
    /// Recorded per item; the larger unit of work continues
    PartialFailure,
    /// Resolved by the timeout path; reported, not retried
    Expiry,
    NotFound,
    /// Aborts the unit of work
    Fatal,
}

/// Errors from engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    // Preconditions
    #[error("workflow {0} is not active")]
    WorkflowNotActive(Uuid),

    #[error("contact {0} has opted out")]
    ContactOptedOut(Uuid),

    #[error("contact {0} not found")]
    ContactNotFound(Uuid),

    #[error("contact {contact_id} is already enrolled in workflow {workflow_id}")]
    DuplicateEnrollment { workflow_id: Uuid, contact_id: Uuid },

    // Concurrency
    #[error("execution {execution_id} is leased by {owner}")]
    ExecutionLocked { execution_id: Uuid, owner: String },

    #[error("account {account_id} has {running} running executions (limit {limit})")]
    ConcurrentExecutionLimit {
        account_id: Uuid,
        running: usize,
        limit: usize,
    },

    #[error("workflow {workflow_id} already has an active migration {migration_id}")]
    MigrationInProgress { workflow_id: Uuid, migration_id: Uuid },

    // Execution faults
    #[error("action at node {node_id} failed after {attempts} attempts: {message}")]
    RetryExhausted {
        execution_id: Uuid,
        node_id: NodeId,
        attempts: u32,
        message: String,
    },

    #[error("execution {execution_id} exceeded its maximum duration ({elapsed:?})")]
    ExecutionTimeout { execution_id: Uuid, elapsed: Duration },

    #[error("execution {execution_id} is already {status}")]
    ExecutionTerminal {
        execution_id: Uuid,
        status: ExecutionStatus,
    },

    #[error("execution {execution_id} is {status}, expected {expected}")]
    InvalidExecutionState {
        execution_id: Uuid,
        status: ExecutionStatus,
        expected: &'static str,
    },

    // Expiry
    #[error("wait {0} is no longer open")]
    WaitExpired(Uuid),

    #[error("event listener {0} has expired")]
    ListenerExpired(Uuid),

    #[error("event listener not found for wait {0}")]
    ListenerNotFound(Uuid),

    // Bulk enrollment
    #[error("bulk enrollment job {job_id} cannot be cancelled in status {status}")]
    JobNotCancellable { job_id: Uuid, status: BulkJobStatus },

    #[error("batch {batch_id} cannot be retried in status {status}")]
    BatchNotRetryable { batch_id: Uuid, status: BatchStatus },

    #[error("invalid contact selection: {0}")]
    InvalidSelection(String),

    // Versions and migrations
    #[error("workflow {workflow_id} reached the maximum of {max} versions")]
    VersionLimitReached { workflow_id: Uuid, max: u32 },

    #[error("invalid migration: {0}")]
    InvalidMigration(String),

    #[error("migration {migration_id} is {status}")]
    MigrationNotActive {
        migration_id: Uuid,
        status: MigrationStatus,
    },

    #[error("no mapping for node {node_id} of execution {execution_id}")]
    NoMapping { execution_id: Uuid, node_id: NodeId },

    #[error("node {target} cannot host execution {execution_id}: {reason}")]
    IncompatibleNode {
        execution_id: Uuid,
        target: NodeId,
        reason: String,
    },
}

impl From<TriggerError> for EngineError {
    fn from(err: TriggerError) -> Self {
        match err {
            TriggerError::Definition(e) => EngineError::Definition(e),
            TriggerError::Store(e) => EngineError::Store(e),
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Store(e) => match e {
                StoreError::LeaseLost { .. }
                | StoreError::Conflict(_)
                | StoreError::MigrationInProgress { .. } => ErrorKind::Concurrency,
                StoreError::TerminalState { .. } | StoreError::InvalidTransition { .. } => {
                    ErrorKind::Precondition
                }
                StoreError::Database(_) => ErrorKind::Transient,
                StoreError::Serialization(_) => ErrorKind::Fatal,
                _ => ErrorKind::NotFound,
            },
            EngineError::Definition(e) => match e {
                DefinitionError::NotFound { .. } => ErrorKind::NotFound,
                e if e.is_transient() => ErrorKind::Transient,
                _ => ErrorKind::Fatal,
            },
            EngineError::Collaborator(e) => match e {
                CollaboratorError::Unavailable(_) => ErrorKind::Transient,
                CollaboratorError::Invalid(_) => ErrorKind::Fatal,
            },

            EngineError::WorkflowNotActive(_)
            | EngineError::ContactOptedOut(_)
            | EngineError::DuplicateEnrollment { .. }
            | EngineError::ExecutionTerminal { .. }
            | EngineError::InvalidExecutionState { .. }
            | EngineError::JobNotCancellable { .. }
            | EngineError::BatchNotRetryable { .. }
            | EngineError::InvalidSelection(_)
            | EngineError::VersionLimitReached { .. }
            | EngineError::InvalidMigration(_)
            | EngineError::MigrationNotActive { .. } => ErrorKind::Precondition,

            EngineError::ContactNotFound(_) | EngineError::ListenerNotFound(_) => {
                ErrorKind::NotFound
            }

            EngineError::ExecutionLocked { .. }
            | EngineError::ConcurrentExecutionLimit { .. }
            | EngineError::MigrationInProgress { .. } => ErrorKind::Concurrency,

            EngineError::RetryExhausted { .. } | EngineError::ExecutionTimeout { .. } => {
                ErrorKind::Fatal
            }

            EngineError::WaitExpired(_) | EngineError::ListenerExpired(_) => ErrorKind::Expiry,

            EngineError::NoMapping { .. } | EngineError::IncompatibleNode { .. } => {
                ErrorKind::PartialFailure
            }
        }
    }

    /// Stable code recorded on per-item failure rows
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::Store(StoreError::Conflict(_)) => "CONFLICT",
            EngineError::Store(StoreError::LeaseLost { .. }) => "LEASE_LOST",
            EngineError::Store(_) => "STORE_ERROR",
            EngineError::Definition(_) => "INVALID_DEFINITION",
            EngineError::Collaborator(_) => "COLLABORATOR_UNAVAILABLE",
            EngineError::WorkflowNotActive(_) => "WORKFLOW_NOT_ACTIVE",
            EngineError::ContactOptedOut(_) => "CONTACT_OPTED_OUT",
            EngineError::ContactNotFound(_) => "CONTACT_NOT_FOUND",
            EngineError::DuplicateEnrollment { .. } => "DUPLICATE_ENROLLMENT",
            EngineError::ExecutionLocked { .. } => "EXECUTION_LOCKED",
            EngineError::ConcurrentExecutionLimit { .. } => "CONCURRENT_EXECUTION_LIMIT",
            EngineError::MigrationInProgress { .. } => "MIGRATION_IN_PROGRESS",
            EngineError::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            EngineError::ExecutionTimeout { .. } => "EXECUTION_TIMEOUT",
            EngineError::ExecutionTerminal { .. } => "EXECUTION_TERMINAL",
            EngineError::InvalidExecutionState { .. } => "INVALID_EXECUTION_STATE",
            EngineError::WaitExpired(_) => "WAIT_EXPIRED",
            EngineError::ListenerExpired(_) => "EVENT_LISTENER_EXPIRED",
            EngineError::ListenerNotFound(_) => "EVENT_LISTENER_NOT_FOUND",
            EngineError::JobNotCancellable { .. } => "JOB_NOT_CANCELLABLE",
            EngineError::BatchNotRetryable { .. } => "BATCH_NOT_RETRYABLE",
            EngineError::InvalidSelection(_) => "INVALID_SELECTION",
            EngineError::VersionLimitReached { .. } => "VERSION_LIMIT_REACHED",
            EngineError::InvalidMigration(_) => "INVALID_MIGRATION",
            EngineError::MigrationNotActive { .. } => "MIGRATION_NOT_ACTIVE",
            EngineError::NoMapping { .. } => "NO_MAPPING",
            EngineError::IncompatibleNode { .. } => "INCOMPATIBLE_NODE",
        }
    }

    /// Error scoped to a single contact of a bulk batch
    pub fn is_per_contact(&self) -> bool {
        matches!(
            self,
            EngineError::ContactOptedOut(_)
                | EngineError::ContactNotFound(_)
                | EngineError::DuplicateEnrollment { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Concurrency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let id = Uuid::now_v7();
        assert_eq!(EngineError::ContactOptedOut(id).kind(), ErrorKind::Precondition);
        assert_eq!(
            EngineError::ExecutionLocked {
                execution_id: id,
                owner: "w".into()
            }
            .kind(),
            ErrorKind::Concurrency
        );
        assert_eq!(
            EngineError::Store(StoreError::Database("down".into())).kind(),
            ErrorKind::Transient
        );
        assert_eq!(EngineError::WaitExpired(id).kind(), ErrorKind::Expiry);
        assert_eq!(
            EngineError::NoMapping {
                execution_id: id,
                node_id: "a".into()
            }
            .kind(),
            ErrorKind::PartialFailure
        );
    }

    #[test]
    fn test_per_contact_errors() {
        let id = Uuid::now_v7();
        assert!(EngineError::ContactNotFound(id).is_per_contact());
        assert!(EngineError::DuplicateEnrollment {
            workflow_id: id,
            contact_id: id
        }
        .is_per_contact());
        assert!(!EngineError::WorkflowNotActive(id).is_per_contact());
        assert_eq!(EngineError::ContactOptedOut(id).error_code(), "CONTACT_OPTED_OUT");
    }
}
