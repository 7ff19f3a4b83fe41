//! Workflow definition snapshots
//!
//! A snapshot is produced by the authoring layer and consumed read-only by the
//! engine. It is validated once when loaded so that steppers never meet an
//! unknown action type or a dangling branch at dispatch time.

mod action;
mod condition;
mod goal;
mod node;
mod snapshot;
mod wait;

use thiserror::Error;
use uuid::Uuid;

pub use action::{
    ActionKind, CreateTaskConfig, HttpMethod, MakeCallConfig, NotificationConfig,
    PipelineStageConfig, SendEmailConfig, SendSmsConfig, TagConfig, UpdateFieldConfig,
    WebhookConfig,
};
pub use condition::{ConditionSpec, DateOperator, EngagementKind, TagMatch};
pub use goal::{GoalConfig, GoalCriteria, GoalType};
pub use node::{ActionNode, Branch, BranchType, ConditionNode, Node, NodeId, NodeKind, WaitNode};
pub use snapshot::{TriggerConfig, WorkflowDefinition, WorkflowSettings};
pub use wait::WaitConfig;

/// Errors loading or validating a definition snapshot
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DefinitionError {
    #[error("workflow {workflow_id} version {version:?} not found")]
    NotFound {
        workflow_id: Uuid,
        version: Option<u32>,
    },

    #[error("definition snapshot could not be parsed: {0}")]
    Parse(String),

    #[error("entry node '{0}' does not exist")]
    MissingEntryNode(String),

    #[error("node '{0}' is defined more than once")]
    DuplicateNode(String),

    #[error("node '{from}' points to unknown node '{to}'")]
    DanglingReference { from: String, to: String },

    #[error("node '{0}' referenced by the execution does not exist")]
    UnknownNode(String),

    #[error("action node '{node_id}': {reason}")]
    InvalidAction { node_id: String, reason: String },

    #[error("condition node '{node_id}': {reason}")]
    InvalidCondition { node_id: String, reason: String },

    #[error("wait node '{node_id}': {reason}")]
    InvalidWait { node_id: String, reason: String },

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("goal {goal_id}: {reason}")]
    InvalidGoal { goal_id: Uuid, reason: String },

    #[error("graph contains a cycle through node '{0}'")]
    Cycle(String),

    #[error("definition store unavailable: {0}")]
    Unavailable(String),
}

impl DefinitionError {
    /// Backend hiccup rather than a broken snapshot
    pub fn is_transient(&self) -> bool {
        matches!(self, DefinitionError::Unavailable(_))
    }
}
