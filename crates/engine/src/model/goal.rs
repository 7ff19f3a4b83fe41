//! Goal achievements

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::definition::{GoalConfig, GoalType};

/// Immutable fact: a contact reached a goal
///
/// At most one exists per (`contact_id`, `goal_config_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalAchievement {
    pub id: Uuid,
    pub goal_config_id: Uuid,
    pub goal_type: GoalType,
    pub account_id: Uuid,
    pub contact_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_execution_id: Uuid,
    pub trigger_event_type: Option<String>,
    pub event_data: Value,
    pub achieved_at: DateTime<Utc>,
}

impl GoalAchievement {
    pub fn new(
        goal: &GoalConfig,
        account_id: Uuid,
        contact_id: Uuid,
        workflow_id: Uuid,
        workflow_execution_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            goal_config_id: goal.id,
            goal_type: goal.goal_type,
            account_id,
            contact_id,
            workflow_id,
            workflow_execution_id,
            trigger_event_type: None,
            event_data: Value::Null,
            achieved_at: Utc::now(),
        }
    }

    pub fn with_event(mut self, event_type: impl Into<String>, event_data: Value) -> Self {
        self.trigger_event_type = Some(event_type.into());
        self.event_data = event_data;
        self
    }
}
