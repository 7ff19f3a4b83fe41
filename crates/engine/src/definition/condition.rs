//! Condition configurations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::criteria::{FieldCriterion, Operator};

/// How a set of tags is tested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TagMatch {
    #[default]
    Any,
    All,
    None,
}

/// Date comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateOperator {
    Before,
    After,
    /// Same calendar day (UTC)
    On,
    WithinLastDays,
    WithinNextDays,
    OlderThanDays,
}

/// Email engagement test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    Opened,
    Clicked,
    NotOpened,
    NotClicked,
}

/// Typed condition configuration, one variant per condition type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition_type", rename_all = "snake_case")]
pub enum ConditionSpec {
    /// Standard or custom field equals a value
    ContactFieldEquals { field: String, value: Value },

    /// Standard or custom field compared with an operator
    ContactField {
        field: String,
        #[serde(default)]
        operator: Operator,
        #[serde(default)]
        value: Option<Value>,
    },

    /// Custom field compared with an operator
    CustomField {
        field: String,
        #[serde(default)]
        operator: Operator,
        #[serde(default)]
        value: Option<Value>,
    },

    ContactHasTag {
        #[serde(default)]
        tag: Option<String>,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        match_mode: TagMatch,
    },

    /// Contact is in the pipeline, optionally in one of the listed stages
    PipelineStage {
        pipeline_id: String,
        #[serde(default)]
        stage_ids: Vec<String>,
    },

    DateComparison {
        field: String,
        operator: DateOperator,
        #[serde(default)]
        value: Option<DateTime<Utc>>,
        #[serde(default)]
        days: Option<i64>,
    },

    EmailEngagement {
        engagement: EngagementKind,
        #[serde(default)]
        campaign_id: Option<String>,
        #[serde(default)]
        within_days: Option<i64>,
    },

    /// Every nested condition matches
    All { conditions: Vec<ConditionSpec> },

    /// At least one nested condition matches
    Any { conditions: Vec<ConditionSpec> },
}

impl ConditionSpec {
    /// Wire name of the condition type
    pub fn condition_type(&self) -> &'static str {
        match self {
            ConditionSpec::ContactFieldEquals { .. } => "contact_field_equals",
            ConditionSpec::ContactField { .. } => "contact_field",
            ConditionSpec::CustomField { .. } => "custom_field",
            ConditionSpec::ContactHasTag { .. } => "contact_has_tag",
            ConditionSpec::PipelineStage { .. } => "pipeline_stage",
            ConditionSpec::DateComparison { .. } => "date_comparison",
            ConditionSpec::EmailEngagement { .. } => "email_engagement",
            ConditionSpec::All { .. } => "all",
            ConditionSpec::Any { .. } => "any",
        }
    }

    pub fn has_tag(tag: impl Into<String>) -> Self {
        ConditionSpec::ContactHasTag {
            tag: Some(tag.into()),
            tags: Vec::new(),
            match_mode: TagMatch::Any,
        }
    }

    pub fn field_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        ConditionSpec::ContactFieldEquals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            ConditionSpec::ContactFieldEquals { field, .. } => non_empty("field", field),
            ConditionSpec::ContactField {
                field,
                operator,
                value,
            }
            | ConditionSpec::CustomField {
                field,
                operator,
                value,
            } => FieldCriterion {
                field: field.clone(),
                operator: *operator,
                value: value.clone(),
            }
            .validate(),
            ConditionSpec::ContactHasTag { tag, tags, .. } => {
                if tag.is_none() && tags.is_empty() {
                    Err("contact_has_tag needs a tag".to_string())
                } else {
                    Ok(())
                }
            }
            ConditionSpec::PipelineStage { pipeline_id, .. } => {
                non_empty("pipeline_id", pipeline_id)
            }
            ConditionSpec::DateComparison {
                field,
                operator,
                value,
                days,
            } => {
                non_empty("field", field)?;
                match operator {
                    DateOperator::Before | DateOperator::After | DateOperator::On
                        if value.is_none() =>
                    {
                        Err("date comparison needs a value".to_string())
                    }
                    DateOperator::WithinLastDays
                    | DateOperator::WithinNextDays
                    | DateOperator::OlderThanDays
                        if !matches!(days, Some(d) if *d >= 0) =>
                    {
                        Err("relative date comparison needs a non-negative day count".to_string())
                    }
                    _ => Ok(()),
                }
            }
            ConditionSpec::EmailEngagement { within_days, .. } => match within_days {
                Some(d) if *d < 0 => Err("within_days must not be negative".to_string()),
                _ => Ok(()),
            },
            ConditionSpec::All { conditions } | ConditionSpec::Any { conditions } => {
                if conditions.is_empty() {
                    return Err("composite condition needs at least one member".to_string());
                }
                conditions.iter().try_for_each(ConditionSpec::validate)
            }
        }
    }
}

fn non_empty(name: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{} must not be empty", name))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_has_tag() {
        let spec: ConditionSpec = serde_json::from_value(json!({
            "condition_type": "contact_has_tag",
            "tag": "lead"
        }))
        .unwrap();

        assert_eq!(spec, ConditionSpec::has_tag("lead"));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_nested_composite() {
        let spec: ConditionSpec = serde_json::from_value(json!({
            "condition_type": "all",
            "conditions": [
                {"condition_type": "contact_field", "field": "score", "operator": "greater_than", "value": 50},
                {"condition_type": "pipeline_stage", "pipeline_id": "sales", "stage_ids": ["won"]}
            ]
        }))
        .unwrap();

        assert_eq!(spec.condition_type(), "all");
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_incomplete_configs() {
        let no_tag = ConditionSpec::ContactHasTag {
            tag: None,
            tags: vec![],
            match_mode: TagMatch::Any,
        };
        assert!(no_tag.validate().is_err());

        let no_days = ConditionSpec::DateComparison {
            field: "birthday".into(),
            operator: DateOperator::WithinNextDays,
            value: None,
            days: None,
        };
        assert!(no_days.validate().is_err());

        assert!(ConditionSpec::All { conditions: vec![] }.validate().is_err());
    }
}
