//! Repository traits for engine state
//!
//! One trait per aggregate. Every mutation that can race is expressed as an
//! atomic conditional update: lease tokens for executions, compare-and-set on
//! status for waits, listeners, jobs, batches and migrations, and
//! insert-if-absent for goal achievements.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    ActionExecution, BatchStatus, BulkEnrollmentBatch, BulkEnrollmentFailure, BulkEnrollmentJob,
    BulkJobStatus, ConditionLog, EventListener, ExecutionStatus, GoalAchievement, JobCounters,
    ListenerStatus, MigrationErrorEntry, MigrationStatus, ResumedBy, VersionMigration,
    WaitExecution, WaitStatus, WorkflowExecution, WorkflowVersion,
};

/// Errors from store operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("action execution not found: {0}")]
    ActionExecutionNotFound(Uuid),

    #[error("wait execution not found: {0}")]
    WaitNotFound(Uuid),

    #[error("event listener not found: {0}")]
    ListenerNotFound(Uuid),

    #[error("bulk enrollment job not found: {0}")]
    JobNotFound(Uuid),

    #[error("bulk enrollment batch not found: {0}")]
    BatchNotFound(Uuid),

    #[error("workflow {workflow_id} version {version} not found")]
    VersionNotFound { workflow_id: Uuid, version: String },

    #[error("migration not found: {0}")]
    MigrationNotFound(Uuid),

    #[error("lease on execution {execution_id} is no longer held")]
    LeaseLost { execution_id: Uuid },

    #[error("execution {execution_id} is already {status}")]
    TerminalState {
        execution_id: Uuid,
        status: ExecutionStatus,
    },

    #[error("execution {execution_id} cannot move from {from} to {to}")]
    InvalidTransition {
        execution_id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("workflow {workflow_id} already has an active migration {migration_id}")]
    MigrationInProgress { workflow_id: Uuid, migration_id: Uuid },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Exclusive, time-bounded ownership of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub execution_id: Uuid,
    pub token: Uuid,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a lease request
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOutcome {
    Acquired(Lease),
    /// Another owner holds an unexpired lease
    Held {
        owner: String,
        expires_at: DateTime<Utc>,
    },
    /// Starting this queued execution would exceed the account ceiling
    LimitReached { running: usize },
    /// Execution already finished
    Terminal(ExecutionStatus),
}

/// Lease request parameters
#[derive(Debug, Clone)]
pub struct LeaseRequest<'a> {
    pub execution_id: Uuid,
    pub owner: &'a str,
    pub ttl: Duration,
    pub now: DateTime<Utc>,
    /// Account ceiling checked when the execution is still `queued`
    pub start_limit: Option<usize>,
}

/// Result of inserting a wait (unique per execution and step)
#[derive(Debug, Clone, PartialEq)]
pub enum WaitInsert {
    Inserted,
    Existing(WaitExecution),
}

/// Result of closing a listener together with its wait
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerClose {
    /// Another resumer closed the listener first; nothing was written
    AlreadyClosed,
    /// The listener closed; the wait after its transition, or `None` if it
    /// was no longer in the expected status
    Closed(Option<WaitExecution>),
}

/// Result of trying to register a migration
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationStart {
    Started,
    InProgress(Uuid),
}

/// Compare-and-set request for a wait
#[derive(Debug, Clone)]
pub struct WaitTransition<'a> {
    pub wait_id: Uuid,
    pub from: &'a [WaitStatus],
    pub to: WaitStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub pending_resume: Option<ResumedBy>,
    pub resumed_by: Option<ResumedBy>,
    pub resume_event: Option<Value>,
    pub error_message: Option<String>,
    pub now: DateTime<Utc>,
}

impl<'a> WaitTransition<'a> {
    pub fn new(wait_id: Uuid, from: &'a [WaitStatus], to: WaitStatus, now: DateTime<Utc>) -> Self {
        Self {
            wait_id,
            from,
            to,
            scheduled_at: None,
            pending_resume: None,
            resumed_by: None,
            resume_event: None,
            error_message: None,
            now,
        }
    }
}

// =============================================================================
// Executions
// =============================================================================

#[async_trait]
pub trait ExecutionRepository: Send + Sync + 'static {
    /// Insert a new execution
    ///
    /// Fails with `Conflict` when the contact already has a non-terminal
    /// execution of the same workflow.
    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError>;

    /// Every execution of one workflow for one contact, oldest first
    async fn find_executions_for_contact(
        &self,
        workflow_id: Uuid,
        contact_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Non-terminal executions for a contact across all workflows
    async fn list_open_executions_for_contact(
        &self,
        account_id: Uuid,
        contact_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Non-terminal executions pinned to a version, ordered by id, after `after`
    async fn list_in_flight(
        &self,
        workflow_id: Uuid,
        version: u32,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;

    async fn count_in_flight(&self, workflow_id: Uuid, version: u32) -> Result<usize, StoreError>;

    /// Active or waiting executions of an account
    async fn count_running(&self, account_id: Uuid) -> Result<usize, StoreError>;

    /// Queued or active executions with `next_run_at <= now` and no live lease
    async fn list_runnable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>, StoreError>;

    /// Acquire the execution lease
    ///
    /// An expired lease may be taken over. For a queued execution with a
    /// `start_limit`, the account ceiling is checked atomically with the
    /// acquisition; queued executions leased by other owners count as running.
    async fn acquire_lease(&self, request: LeaseRequest<'_>) -> Result<LeaseOutcome, StoreError>;

    /// Extend a held lease
    async fn renew_lease(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> Result<Lease, StoreError>;

    /// Release a held lease (no-op if it was lost)
    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError>;

    /// Persist an execution under its lease
    ///
    /// Rejects writes when the lease was lost (`LeaseLost`), when the stored
    /// row is terminal (`TerminalState`), or when the status move is illegal.
    async fn save_execution(&self, lease: &Lease, execution: &WorkflowExecution) -> Result<(), StoreError>;

    /// Lease-free compare-and-set of the status (cooperative cancellation)
    async fn transition_execution(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowExecution>, StoreError>;

    // =========================================================================
    // Action executions
    // =========================================================================

    /// Insert an action execution; `Conflict` if a non-terminal one exists
    async fn insert_action_execution(&self, action: &ActionExecution) -> Result<(), StoreError>;

    async fn update_action_execution(&self, action: &ActionExecution) -> Result<(), StoreError>;

    /// The non-terminal action execution of an execution, if any
    async fn open_action_execution(&self, execution_id: Uuid) -> Result<Option<ActionExecution>, StoreError>;

    async fn list_action_executions(&self, execution_id: Uuid) -> Result<Vec<ActionExecution>, StoreError>;

    // =========================================================================
    // Condition logs
    // =========================================================================

    async fn insert_condition_log(&self, log: &ConditionLog) -> Result<(), StoreError>;

    async fn list_condition_logs(&self, execution_id: Uuid) -> Result<Vec<ConditionLog>, StoreError>;
}

// =============================================================================
// Waits
// =============================================================================

#[async_trait]
pub trait WaitRepository: Send + Sync + 'static {
    /// Insert a wait, or return the existing one for the same execution and step
    async fn insert_wait(&self, wait: &WaitExecution) -> Result<WaitInsert, StoreError>;

    async fn get_wait(&self, id: Uuid) -> Result<WaitExecution, StoreError>;

    /// Open (waiting or scheduled) wait of an execution
    async fn open_wait_for_execution(&self, execution_id: Uuid) -> Result<Option<WaitExecution>, StoreError>;

    /// Scheduled waits with `scheduled_at <= now`, earliest first
    async fn list_due_waits(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WaitExecution>, StoreError>;

    /// Compare-and-set on wait status; `None` if the status was not in `from`
    async fn transition_wait(&self, transition: WaitTransition<'_>) -> Result<Option<WaitExecution>, StoreError>;
}

// =============================================================================
// Event listeners
// =============================================================================

#[async_trait]
pub trait EventListenerRepository: Send + Sync + 'static {
    /// Insert a listener; `Conflict` if one exists for the wait and event type
    async fn insert_listener(&self, listener: &EventListener) -> Result<(), StoreError>;

    async fn get_listener(&self, id: Uuid) -> Result<EventListener, StoreError>;

    async fn find_listener_for_wait(&self, wait_execution_id: Uuid) -> Result<Option<EventListener>, StoreError>;

    /// Active listeners for an event type and contact
    async fn find_active_listeners(
        &self,
        event_type: &str,
        contact_id: Uuid,
    ) -> Result<Vec<EventListener>, StoreError>;

    /// Active listeners with `expires_at <= now`
    async fn list_expired_listeners(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventListener>, StoreError>;

    /// Compare-and-set `active → to`; `false` if the listener already left `active`
    async fn close_listener(
        &self,
        id: Uuid,
        to: ListenerStatus,
        event: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Close an active listener and apply `transition` to its wait atomically
    ///
    /// Both writes land or neither does, so a closed listener never leaves
    /// its wait stranded in `waiting`.
    async fn close_listener_with_wait(
        &self,
        id: Uuid,
        to: ListenerStatus,
        event: Option<Value>,
        transition: WaitTransition<'_>,
    ) -> Result<ListenerClose, StoreError>;
}

// =============================================================================
// Goals
// =============================================================================

#[async_trait]
pub trait GoalRepository: Send + Sync + 'static {
    async fn has_achievement(&self, contact_id: Uuid, goal_config_id: Uuid) -> Result<bool, StoreError>;

    /// Insert unless one exists for (contact, goal); `true` if inserted
    async fn record_achievement(&self, achievement: &GoalAchievement) -> Result<bool, StoreError>;

    /// Record a goal achievement and save the execution that exits on it
    ///
    /// Atomic: `false` with nothing written when the contact already has
    /// the achievement; a rejected execution save leaves no achievement.
    async fn record_goal_exit(
        &self,
        lease: &Lease,
        execution: &WorkflowExecution,
        achievement: &GoalAchievement,
    ) -> Result<bool, StoreError>;

    async fn list_achievements(&self, contact_id: Uuid) -> Result<Vec<GoalAchievement>, StoreError>;
}

// =============================================================================
// Bulk jobs
// =============================================================================

#[async_trait]
pub trait BulkJobRepository: Send + Sync + 'static {
    async fn insert_job(&self, job: &BulkEnrollmentJob) -> Result<(), StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<BulkEnrollmentJob, StoreError>;

    /// Compare-and-set on job status, maintaining start and completion times
    async fn transition_job(
        &self,
        id: Uuid,
        from: &[BulkJobStatus],
        to: BulkJobStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<BulkEnrollmentJob>, StoreError>;

    async fn update_job_counters(&self, id: Uuid, counters: &JobCounters) -> Result<(), StoreError>;

    async fn insert_batches(&self, batches: &[BulkEnrollmentBatch]) -> Result<(), StoreError>;

    async fn get_batch(&self, id: Uuid) -> Result<BulkEnrollmentBatch, StoreError>;

    /// Batches of a job ordered by batch number
    async fn list_batches(&self, job_id: Uuid) -> Result<Vec<BulkEnrollmentBatch>, StoreError>;

    /// Compare-and-set `pending → processing`, bumping `attempt_count`
    async fn claim_batch(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<BulkEnrollmentBatch>, StoreError>;

    /// Persist per-contact progress and status of a claimed batch
    async fn save_batch(&self, batch: &BulkEnrollmentBatch) -> Result<(), StoreError>;

    /// Compare-and-set on batch status
    async fn transition_batch(
        &self,
        id: Uuid,
        from: &[BatchStatus],
        to: BatchStatus,
    ) -> Result<bool, StoreError>;

    /// Record a failure; idempotent per (batch, contact)
    async fn insert_failure(&self, failure: &BulkEnrollmentFailure) -> Result<(), StoreError>;

    async fn list_failures(&self, job_id: Uuid) -> Result<Vec<BulkEnrollmentFailure>, StoreError>;
}

// =============================================================================
// Versions and migrations
// =============================================================================

#[async_trait]
pub trait VersionRepository: Send + Sync + 'static {
    /// Insert a version; `Conflict` if the number is taken
    async fn insert_version(&self, version: &WorkflowVersion) -> Result<(), StoreError>;

    async fn get_version(&self, id: Uuid) -> Result<WorkflowVersion, StoreError>;

    async fn get_version_by_number(&self, workflow_id: Uuid, number: u32) -> Result<WorkflowVersion, StoreError>;

    async fn current_version(&self, workflow_id: Uuid) -> Result<Option<WorkflowVersion>, StoreError>;

    async fn latest_version_number(&self, workflow_id: Uuid) -> Result<Option<u32>, StoreError>;

    async fn list_versions(&self, workflow_id: Uuid) -> Result<Vec<WorkflowVersion>, StoreError>;

    /// Current versions of an account's workflows
    async fn list_current_versions(&self, account_id: Uuid) -> Result<Vec<WorkflowVersion>, StoreError>;

    /// Make a version current and archive the previous one
    ///
    /// When `migration` is given it is registered in the same atomic step;
    /// `MigrationInProgress` if the workflow already has an active one.
    async fn publish_version(
        &self,
        version_id: Uuid,
        migration: Option<&VersionMigration>,
        now: DateTime<Utc>,
    ) -> Result<WorkflowVersion, StoreError>;

    /// Archive the current version without a replacement
    async fn deactivate_workflow(&self, workflow_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Adjust the `active_executions` counter (no-op for unknown versions)
    async fn adjust_active_executions(&self, workflow_id: Uuid, version: u32, delta: i64) -> Result<(), StoreError>;

    /// Register a migration unless the workflow already has an active one
    async fn try_start_migration(&self, migration: &VersionMigration) -> Result<MigrationStart, StoreError>;

    async fn get_migration(&self, id: Uuid) -> Result<VersionMigration, StoreError>;

    async fn active_migration(&self, workflow_id: Uuid) -> Result<Option<VersionMigration>, StoreError>;

    /// Compare-and-set on migration status
    async fn transition_migration(
        &self,
        id: Uuid,
        from: &[MigrationStatus],
        to: MigrationStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<VersionMigration>, StoreError>;

    /// Atomically add to the progress counters and error log
    async fn record_migration_progress(
        &self,
        id: Uuid,
        migrated: usize,
        failed: Vec<MigrationErrorEntry>,
        cursor: Option<Uuid>,
    ) -> Result<VersionMigration, StoreError>;

    async fn set_migration_total(&self, id: Uuid, total: usize) -> Result<(), StoreError>;
}

/// Every repository the engine needs, behind one object
pub trait EngineStore:
    ExecutionRepository
    + WaitRepository
    + EventListenerRepository
    + GoalRepository
    + BulkJobRepository
    + VersionRepository
{
}

impl<T> EngineStore for T where
    T: ExecutionRepository
        + WaitRepository
        + EventListenerRepository
        + GoalRepository
        + BulkJobRepository
        + VersionRepository
{
}
