//! Action executions: one attempt history per action node visit

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::definition::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    /// Waiting for a retry at `scheduled_at`
    Scheduled,
    Running,
    Completed,
    Failed,
    Skipped,
    /// Placeholder for a wait node that has not resumed yet
    Waiting,
}

string_enum!(ActionStatus {
    Pending => "pending",
    Scheduled => "scheduled",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
    Waiting => "waiting",
});

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed | ActionStatus::Failed | ActionStatus::Skipped
        )
    }
}

/// Record of an action node being run for one execution
///
/// At most one non-terminal row exists per execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionExecution {
    pub id: Uuid,
    pub workflow_execution_id: Uuid,
    pub node_id: NodeId,
    pub action_type: String,
    pub status: ActionStatus,
    /// Input bound at dispatch time
    pub execution_data: Value,
    pub result_data: Option<Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ActionExecution {
    pub fn new(workflow_execution_id: Uuid, node_id: impl Into<NodeId>, action_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_execution_id,
            node_id: node_id.into(),
            action_type: action_type.into(),
            status: ActionStatus::Pending,
            execution_data: Value::Null,
            result_data: None,
            error_message: None,
            retry_count: 0,
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn start(&mut self, execution_data: Value, now: DateTime<Utc>) {
        self.status = ActionStatus::Running;
        self.execution_data = execution_data;
        self.started_at = Some(now);
        self.scheduled_at = None;
    }

    pub fn complete(&mut self, result_data: Value, now: DateTime<Utc>) {
        self.status = ActionStatus::Completed;
        self.result_data = Some(result_data);
        self.completed_at = Some(now);
    }

    pub fn skip(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = ActionStatus::Skipped;
        self.error_message = Some(reason.into());
        self.completed_at = Some(now);
    }

    pub fn schedule_retry(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.status = ActionStatus::Scheduled;
        self.error_message = Some(error.into());
        self.scheduled_at = Some(at);
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = ActionStatus::Failed;
        self.error_message = Some(error.into());
        self.completed_at = Some(now);
    }
}
