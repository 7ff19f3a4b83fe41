//! Goal configurations

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::event_types;

/// Kind of goal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalType {
    TagAdded,
    PurchaseMade,
    AppointmentBooked,
    FormSubmitted,
    PipelineStageReached,
}

impl GoalType {
    /// Inbound event type that can achieve this goal
    pub fn event_type(&self) -> &'static str {
        match self {
            GoalType::TagAdded => event_types::TAG_ADDED,
            GoalType::PurchaseMade => event_types::PURCHASE_COMPLETED,
            GoalType::AppointmentBooked => event_types::APPOINTMENT_BOOKED,
            GoalType::FormSubmitted => event_types::FORM_SUBMITTED,
            GoalType::PipelineStageReached => event_types::PIPELINE_STAGE_CHANGED,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GoalType::TagAdded => "tag_added",
            GoalType::PurchaseMade => "purchase_made",
            GoalType::AppointmentBooked => "appointment_booked",
            GoalType::FormSubmitted => "form_submitted",
            GoalType::PipelineStageReached => "pipeline_stage_reached",
        }
    }
}

impl std::fmt::Display for GoalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GoalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tag_added" => Ok(GoalType::TagAdded),
            "purchase_made" => Ok(GoalType::PurchaseMade),
            "appointment_booked" => Ok(GoalType::AppointmentBooked),
            "form_submitted" => Ok(GoalType::FormSubmitted),
            "pipeline_stage_reached" => Ok(GoalType::PipelineStageReached),
            other => Err(format!("unknown goal type: {}", other)),
        }
    }
}

/// Structural criteria; an absent field or `"any"` matches every value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalCriteria {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub min_amount: Option<f64>,
    #[serde(default)]
    pub calendar_id: Option<String>,
    #[serde(default)]
    pub form_id: Option<String>,
    #[serde(default)]
    pub pipeline_id: Option<String>,
    #[serde(default)]
    pub stage_id: Option<String>,
}

/// A goal attached to a workflow version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalConfig {
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    pub goal_type: GoalType,
    #[serde(default)]
    pub criteria: GoalCriteria,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Optimistic lock version maintained by the authoring layer
    #[serde(default = "default_version")]
    pub version: i32,
}

fn default_true() -> bool {
    true
}

fn default_version() -> i32 {
    1
}

impl GoalConfig {
    pub fn new(goal_type: GoalType, criteria: GoalCriteria) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: None,
            goal_type,
            criteria,
            is_active: true,
            version: 1,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.criteria.min_amount {
            Some(amount) if !amount.is_finite() || amount < 0.0 => {
                Err(format!("min_amount {} must be a non-negative number", amount))
            }
            _ => Ok(()),
        }
    }
}
