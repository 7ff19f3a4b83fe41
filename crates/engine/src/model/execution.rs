//! Workflow executions: one contact's run through one workflow version

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::definition::{NodeId, WorkflowDefinition};

/// Execution status
///
/// Moves forward only: `queued → active → (waiting ↔ active)* → terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Active,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

string_enum!(ExecutionStatus {
    Queued => "queued",
    Active => "active",
    Waiting => "waiting",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl ExecutionStatus {
    pub const NON_TERMINAL: [ExecutionStatus; 3] = [
        ExecutionStatus::Queued,
        ExecutionStatus::Active,
        ExecutionStatus::Waiting,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Counted against the per-account concurrency ceiling
    pub fn is_running(&self) -> bool {
        matches!(self, ExecutionStatus::Active | ExecutionStatus::Waiting)
    }

    /// Whether `self → next` is a legal move (re-saving a non-terminal status is)
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match self {
            Queued => matches!(next, Queued | Active | Failed | Cancelled),
            Active => !matches!(next, Queued),
            Waiting => !matches!(next, Queued),
            Completed | Failed | Cancelled => false,
        }
    }
}

/// How a contact entered the workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentSource {
    Trigger,
    Bulk,
    Api,
    Manual,
}

string_enum!(EnrollmentSource {
    Trigger => "trigger",
    Bulk => "bulk",
    Api => "api",
    Manual => "manual",
});

/// Why an execution reached a terminal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    EndOfWorkflow,
    GoalAchieved,
    Cancelled,
    Failed,
    Timeout,
}

string_enum!(ExitReason {
    EndOfWorkflow => "end_of_workflow",
    GoalAchieved => "goal_achieved",
    Cancelled => "cancelled",
    Failed => "failed",
    Timeout => "timeout",
});

impl ExitReason {
    /// Default reason recorded when an execution is moved to `status`
    pub fn for_status(status: ExecutionStatus) -> Option<ExitReason> {
        match status {
            ExecutionStatus::Cancelled => Some(ExitReason::Cancelled),
            ExecutionStatus::Failed => Some(ExitReason::Failed),
            ExecutionStatus::Completed => Some(ExitReason::EndOfWorkflow),
            _ => None,
        }
    }
}

/// Illegal status move
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("cannot move execution from {from} to {to}")]
pub struct TransitionError {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

/// One contact's run through one workflow version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: u32,
    pub account_id: Uuid,
    pub contact_id: Uuid,
    pub status: ExecutionStatus,
    /// Node to run next; `None` once the graph is exhausted
    pub current_node_id: Option<NodeId>,
    /// Number of steps taken so far
    pub current_step_index: u32,
    pub enrollment_source: EnrollmentSource,
    /// Earliest time a worker should advance this execution
    pub next_run_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub exit_reason: Option<ExitReason>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    /// New queued execution positioned at the definition's entry node
    pub fn new(
        definition: &WorkflowDefinition,
        contact_id: Uuid,
        enrollment_source: EnrollmentSource,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id: definition.workflow_id,
            workflow_version: definition.version,
            account_id: definition.account_id,
            contact_id,
            status: ExecutionStatus::Queued,
            current_node_id: definition.entry_node_id.clone(),
            current_step_index: 0,
            enrollment_source,
            next_run_at: Some(now),
            retry_count: 0,
            error_message: None,
            exit_reason: None,
            metadata: json!({}),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        if metadata.is_object() {
            self.metadata = metadata;
        }
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `to`, maintaining timestamps
    pub fn transition(&mut self, to: ExecutionStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        if to == ExecutionStatus::Active && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
            self.next_run_at = None;
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Move to a terminal status with an exit reason
    pub fn finish(
        &mut self,
        to: ExecutionStatus,
        exit_reason: ExitReason,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(to, now)?;
        self.exit_reason = Some(exit_reason);
        if error_message.is_some() {
            self.error_message = error_message;
        }
        Ok(())
    }

    /// Point at the next node after finishing a step
    pub fn advance_to(&mut self, next: Option<NodeId>, now: DateTime<Utc>) {
        self.current_node_id = next;
        self.current_step_index += 1;
        self.updated_at = now;
    }

    /// Result data recorded by earlier action nodes, keyed by node id
    pub fn results(&self) -> Value {
        self.metadata
            .get("results")
            .cloned()
            .unwrap_or_else(|| json!({}))
    }

    pub fn record_result(&mut self, node_id: &str, result: Value) {
        if !self.metadata.is_object() {
            self.metadata = json!({});
        }
        if let Some(meta) = self.metadata.as_object_mut() {
            let results = meta
                .entry("results")
                .or_insert_with(|| json!({}));
            if let Some(map) = results.as_object_mut() {
                map.insert(node_id.to_string(), result);
            }
        }
    }

    /// String value of a metadata key (used for event correlation)
    pub fn metadata_str(&self, key: &str) -> Option<String> {
        match self.metadata.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Audit row for one condition evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionLog {
    pub id: Uuid,
    pub workflow_execution_id: Uuid,
    pub node_id: NodeId,
    pub condition_type: String,
    pub branch_id: String,
    pub matched: bool,
    pub details: Value,
    pub duration_micros: u64,
    pub evaluated_at: DateTime<Utc>,
}
