//! Wait executions and event listeners

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::criteria::FieldCriterion;
use crate::definition::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitType {
    FixedTime,
    UntilDate,
    UntilTime,
    ForEvent,
}

string_enum!(WaitType {
    FixedTime => "fixed_time",
    UntilDate => "until_date",
    UntilTime => "until_time",
    ForEvent => "for_event",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStatus {
    /// Event wait with an active listener
    Waiting,
    /// Due for resumption at `scheduled_at`
    Scheduled,
    Resumed,
    Timeout,
    Cancelled,
    Error,
}

string_enum!(WaitStatus {
    Waiting => "waiting",
    Scheduled => "scheduled",
    Resumed => "resumed",
    Timeout => "timeout",
    Cancelled => "cancelled",
    Error => "error",
});

impl WaitStatus {
    pub const OPEN: [WaitStatus; 2] = [WaitStatus::Waiting, WaitStatus::Scheduled];

    pub fn is_open(&self) -> bool {
        matches!(self, WaitStatus::Waiting | WaitStatus::Scheduled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumedBy {
    Scheduler,
    Event,
    Timeout,
    Manual,
    Cancelled,
}

string_enum!(ResumedBy {
    Scheduler => "scheduler",
    Event => "event",
    Timeout => "timeout",
    Manual => "manual",
    Cancelled => "cancelled",
});

/// Suspension of one execution at one wait node
///
/// Unique per (`workflow_execution_id`, `step_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitExecution {
    pub id: Uuid,
    pub workflow_execution_id: Uuid,
    /// Wait node id
    pub step_id: NodeId,
    pub account_id: Uuid,
    pub contact_id: Uuid,
    pub wait_type: WaitType,
    pub status: WaitStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub event_type: Option<String>,
    pub event_correlation_id: Option<String>,
    pub event_timeout_at: Option<DateTime<Utc>>,
    /// Who will resume a `scheduled` wait; `None` means the scheduler
    pub pending_resume: Option<ResumedBy>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub resumed_by: Option<ResumedBy>,
    pub resume_event: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WaitExecution {
    pub fn new(
        workflow_execution_id: Uuid,
        step_id: impl Into<NodeId>,
        account_id: Uuid,
        contact_id: Uuid,
        wait_type: WaitType,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_execution_id,
            step_id: step_id.into(),
            account_id,
            contact_id,
            wait_type,
            status: WaitStatus::Scheduled,
            scheduled_at: None,
            event_type: None,
            event_correlation_id: None,
            event_timeout_at: None,
            pending_resume: None,
            resumed_at: None,
            resumed_by: None,
            resume_event: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    /// Who resumes this wait once it is due
    pub fn resumer(&self) -> ResumedBy {
        self.pending_resume.unwrap_or(ResumedBy::Scheduler)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerStatus {
    Active,
    Matched,
    Expired,
}

string_enum!(ListenerStatus {
    Active => "active",
    Matched => "matched",
    Expired => "expired",
});

/// Subscription of an event wait to inbound events
///
/// Unique per (`wait_execution_id`, `event_type`). Leaves `active` exactly
/// once, to either `matched` or `expired`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventListener {
    pub id: Uuid,
    pub wait_execution_id: Uuid,
    pub workflow_execution_id: Uuid,
    pub event_type: String,
    pub correlation_id: Option<String>,
    pub account_id: Uuid,
    pub contact_id: Uuid,
    pub match_criteria: Vec<FieldCriterion>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ListenerStatus,
    pub matched_at: Option<DateTime<Utc>>,
    pub matched_event: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl EventListener {
    pub fn for_wait(wait: &WaitExecution, match_criteria: Vec<FieldCriterion>) -> Self {
        Self {
            id: Uuid::now_v7(),
            wait_execution_id: wait.id,
            workflow_execution_id: wait.workflow_execution_id,
            event_type: wait.event_type.clone().unwrap_or_default(),
            correlation_id: wait.event_correlation_id.clone(),
            account_id: wait.account_id,
            contact_id: wait.contact_id,
            match_criteria,
            expires_at: wait.event_timeout_at,
            status: ListenerStatus::Active,
            matched_at: None,
            matched_event: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}
