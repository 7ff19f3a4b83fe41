//! Goal detection
//!
//! Goals are matched structurally against either an inbound event or the
//! contact's accumulated state. Detection is pure; the "already achieved"
//! guard lives in the stepper, which consults the achievement repository
//! under the execution lease.

use serde_json::Value;

use crate::contact::ContactSnapshot;
use crate::definition::{GoalConfig, GoalCriteria, GoalType};

/// What a goal is being checked against
#[derive(Debug, Clone, Copy)]
pub enum GoalSignal<'a> {
    /// An inbound event that may have achieved a goal
    Event { event_type: &'a str, data: &'a Value },
    /// Accumulated contact state (tags, pipeline positions)
    State(&'a ContactSnapshot),
}

/// Active goals satisfied by `signal`, in definition order
pub fn detect<'a>(goals: &'a [GoalConfig], signal: GoalSignal<'_>) -> Vec<&'a GoalConfig> {
    goals
        .iter()
        .filter(|goal| goal.is_active)
        .filter(|goal| match signal {
            GoalSignal::Event { event_type, data } => matches_event(goal, event_type, data),
            GoalSignal::State(contact) => satisfied_by_state(goal, contact),
        })
        .collect()
}

/// Whether an event achieves a goal
pub fn matches_event(goal: &GoalConfig, event_type: &str, data: &Value) -> bool {
    if goal.goal_type.event_type() != event_type {
        return false;
    }
    let c = &goal.criteria;

    match goal.goal_type {
        GoalType::TagAdded => tag_matches(c, data),
        GoalType::PurchaseMade => {
            accepts(&c.product_id, data.get("product_id")) && amount_meets(c.min_amount, data)
        }
        GoalType::AppointmentBooked => accepts(&c.calendar_id, data.get("calendar_id")),
        GoalType::FormSubmitted => accepts(&c.form_id, data.get("form_id")),
        GoalType::PipelineStageReached => {
            accepts(&c.pipeline_id, data.get("pipeline_id"))
                && accepts(&c.stage_id, data.get("stage_id"))
        }
    }
}

/// Whether the contact's current state already satisfies a goal
///
/// Only state-backed goal types can be satisfied this way; purchases,
/// bookings and form submissions need the event itself.
pub fn satisfied_by_state(goal: &GoalConfig, contact: &ContactSnapshot) -> bool {
    let c = &goal.criteria;

    match goal.goal_type {
        GoalType::TagAdded => match specific(&c.tag) {
            Some(tag) => contact.has_tag(tag),
            // "any tag" cannot be told apart from tags the contact entered with
            None => false,
        },
        GoalType::PipelineStageReached => match specific(&c.pipeline_id) {
            Some(pipeline) => contact
                .stage_in(pipeline)
                .map(|s| specific(&c.stage_id).map(|id| id == s.stage_id).unwrap_or(true))
                .unwrap_or(false),
            None => false,
        },
        GoalType::PurchaseMade | GoalType::AppointmentBooked | GoalType::FormSubmitted => false,
    }
}

/// A criterion value that restricts matching (`None` and `"any"` do not)
fn specific(expected: &Option<String>) -> Option<&str> {
    expected
        .as_deref()
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("any"))
}

fn accepts(expected: &Option<String>, actual: Option<&Value>) -> bool {
    let Some(expected) = specific(expected) else {
        return true;
    };
    match actual {
        Some(Value::String(s)) => s.eq_ignore_ascii_case(expected),
        Some(Value::Number(n)) => n.to_string() == expected,
        _ => false,
    }
}

fn tag_matches(criteria: &GoalCriteria, data: &Value) -> bool {
    let Some(expected) = specific(&criteria.tag) else {
        return true;
    };
    if accepts(&criteria.tag, data.get("tag")) {
        return true;
    }
    data.get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .any(|t| t.eq_ignore_ascii_case(expected))
        })
        .unwrap_or(false)
}

fn amount_meets(min_amount: Option<f64>, data: &Value) -> bool {
    let Some(min) = min_amount else {
        return true;
    };
    let amount = data.get("amount").and_then(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    });
    amount.map(|a| a >= min).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_types;
    use serde_json::json;
    use uuid::Uuid;

    fn goal(goal_type: GoalType, criteria: GoalCriteria) -> GoalConfig {
        GoalConfig::new(goal_type, criteria)
    }

    #[test]
    fn test_tag_goal() {
        let g = goal(
            GoalType::TagAdded,
            GoalCriteria {
                tag: Some("customer".into()),
                ..Default::default()
            },
        );
        assert!(matches_event(&g, event_types::TAG_ADDED, &json!({"tag": "Customer"})));
        assert!(matches_event(&g, event_types::TAG_ADDED, &json!({"tags": ["a", "customer"]})));
        assert!(!matches_event(&g, event_types::TAG_ADDED, &json!({"tag": "lead"})));
        assert!(!matches_event(&g, event_types::TAG_REMOVED, &json!({"tag": "customer"})));
    }

    #[test]
    fn test_any_criteria_matches_everything() {
        let g = goal(
            GoalType::FormSubmitted,
            GoalCriteria {
                form_id: Some("any".into()),
                ..Default::default()
            },
        );
        assert!(matches_event(&g, event_types::FORM_SUBMITTED, &json!({"form_id": "f-9"})));
        assert!(matches_event(&g, event_types::FORM_SUBMITTED, &json!({})));
    }

    #[test]
    fn test_purchase_minimum_amount() {
        let g = goal(
            GoalType::PurchaseMade,
            GoalCriteria {
                product_id: Some("p-1".into()),
                min_amount: Some(50.0),
                ..Default::default()
            },
        );
        assert!(matches_event(&g, event_types::PURCHASE_COMPLETED, &json!({"product_id": "p-1", "amount": 75})));
        assert!(matches_event(&g, event_types::PURCHASE_COMPLETED, &json!({"product_id": "p-1", "amount": "50.00"})));
        assert!(!matches_event(&g, event_types::PURCHASE_COMPLETED, &json!({"product_id": "p-1", "amount": 49.99})));
        assert!(!matches_event(&g, event_types::PURCHASE_COMPLETED, &json!({"product_id": "p-1"})));
        assert!(!matches_event(&g, event_types::PURCHASE_COMPLETED, &json!({"product_id": "p-2", "amount": 99})));
    }

    #[test]
    fn test_pipeline_goal() {
        let g = goal(
            GoalType::PipelineStageReached,
            GoalCriteria {
                pipeline_id: Some("sales".into()),
                stage_id: Some("won".into()),
                ..Default::default()
            },
        );
        let data = json!({"pipeline_id": "sales", "stage_id": "won"});
        assert!(matches_event(&g, event_types::PIPELINE_STAGE_CHANGED, &data));

        let contact = ContactSnapshot::new(Uuid::now_v7(), Uuid::now_v7()).with_stage("sales", "won");
        assert!(satisfied_by_state(&g, &contact));
        let elsewhere = ContactSnapshot::new(Uuid::now_v7(), Uuid::now_v7()).with_stage("sales", "open");
        assert!(!satisfied_by_state(&g, &elsewhere));
    }

    #[test]
    fn test_detect_skips_inactive_goals() {
        let mut inactive = goal(GoalType::FormSubmitted, GoalCriteria::default());
        inactive.is_active = false;
        let active = goal(GoalType::FormSubmitted, GoalCriteria::default());
        let goals = vec![inactive, active.clone()];

        let data = json!({"form_id": "f-1"});
        let found = detect(
            &goals,
            GoalSignal::Event {
                event_type: event_types::FORM_SUBMITTED,
                data: &data,
            },
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, active.id);
    }

    #[test]
    fn test_state_only_goals() {
        let g = goal(GoalType::PurchaseMade, GoalCriteria::default());
        let contact = ContactSnapshot::new(Uuid::now_v7(), Uuid::now_v7()).with_tag("buyer");
        assert!(!satisfied_by_state(&g, &contact));

        let tag_goal = goal(
            GoalType::TagAdded,
            GoalCriteria {
                tag: Some("buyer".into()),
                ..Default::default()
            },
        );
        assert!(detect(std::slice::from_ref(&tag_goal), GoalSignal::State(&contact)).len() == 1);
    }
}
