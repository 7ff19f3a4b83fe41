//! Condition evaluation against a contact snapshot

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use crate::contact::ContactSnapshot;
use crate::criteria::{self, Operator};
use crate::definition::{ConditionSpec, DateOperator, EngagementKind, TagMatch};

/// Inputs to one evaluation
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub contact: &'a ContactSnapshot,
    /// Reference time for relative date and engagement windows
    pub now: DateTime<Utc>,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(contact: &'a ContactSnapshot, now: DateTime<Utc>) -> Self {
        Self { contact, now }
    }
}

/// Outcome of evaluating one condition
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    pub matched: bool,
    /// What was compared, for the audit log
    pub details: Value,
}

impl EvaluationResult {
    fn new(matched: bool, details: Value) -> Self {
        Self { matched, details }
    }
}

/// Evaluate a condition; pure and deterministic for a given context
pub fn evaluate(spec: &ConditionSpec, ctx: &EvaluationContext<'_>) -> EvaluationResult {
    let contact = ctx.contact;

    match spec {
        ConditionSpec::ContactFieldEquals { field, value } => {
            let actual = contact.field(field);
            EvaluationResult::new(
                criteria::compare(actual, Operator::Equals, Some(value)),
                json!({ "field": field, "actual": actual, "expected": value }),
            )
        }

        ConditionSpec::ContactField {
            field,
            operator,
            value,
        } => {
            let actual = contact.field(field);
            EvaluationResult::new(
                criteria::compare(actual, *operator, value.as_ref()),
                json!({ "field": field, "operator": operator, "actual": actual, "expected": value }),
            )
        }

        ConditionSpec::CustomField {
            field,
            operator,
            value,
        } => {
            let actual = contact.custom_fields.get(field);
            EvaluationResult::new(
                criteria::compare(actual, *operator, value.as_ref()),
                json!({ "custom_field": field, "operator": operator, "actual": actual, "expected": value }),
            )
        }

        ConditionSpec::ContactHasTag {
            tag,
            tags,
            match_mode,
        } => {
            let wanted: Vec<&str> = tag
                .iter()
                .chain(tags.iter())
                .map(String::as_str)
                .collect();
            let present = wanted.iter().filter(|t| contact.has_tag(t)).count();
            let matched = match match_mode {
                TagMatch::Any => present > 0,
                TagMatch::All => !wanted.is_empty() && present == wanted.len(),
                TagMatch::None => present == 0,
            };
            EvaluationResult::new(
                matched,
                json!({ "tags": wanted, "match_mode": match_mode, "present": present }),
            )
        }

        ConditionSpec::PipelineStage {
            pipeline_id,
            stage_ids,
        } => {
            let stage = contact.stage_in(pipeline_id);
            let matched = match stage {
                Some(s) => stage_ids.is_empty() || stage_ids.iter().any(|id| *id == s.stage_id),
                None => false,
            };
            EvaluationResult::new(
                matched,
                json!({
                    "pipeline_id": pipeline_id,
                    "current_stage": stage.map(|s| s.stage_id.as_str()),
                    "stage_ids": stage_ids,
                }),
            )
        }

        ConditionSpec::DateComparison {
            field,
            operator,
            value,
            days,
        } => {
            let actual = contact.field(field).and_then(parse_timestamp);
            let matched = actual
                .map(|at| compare_date(at, *operator, *value, *days, ctx.now))
                .unwrap_or(false);
            EvaluationResult::new(
                matched,
                json!({ "field": field, "operator": operator, "actual": actual, "value": value, "days": days }),
            )
        }

        ConditionSpec::EmailEngagement {
            engagement,
            campaign_id,
            within_days,
        } => {
            let matched = engagement_matches(contact, *engagement, campaign_id.as_deref(), *within_days, ctx.now);
            EvaluationResult::new(
                matched,
                json!({ "engagement": engagement, "campaign_id": campaign_id, "within_days": within_days }),
            )
        }

        ConditionSpec::All { conditions } => {
            let results: Vec<_> = conditions.iter().map(|c| evaluate(c, ctx)).collect();
            EvaluationResult::new(
                !results.is_empty() && results.iter().all(|r| r.matched),
                json!({ "all": results.iter().map(|r| &r.details).collect::<Vec<_>>() }),
            )
        }

        ConditionSpec::Any { conditions } => {
            let results: Vec<_> = conditions.iter().map(|c| evaluate(c, ctx)).collect();
            EvaluationResult::new(
                results.iter().any(|r| r.matched),
                json!({ "any": results.iter().map(|r| &r.details).collect::<Vec<_>>() }),
            )
        }
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        // Unix seconds
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        _ => None,
    }
}

fn compare_date(
    at: DateTime<Utc>,
    operator: DateOperator,
    value: Option<DateTime<Utc>>,
    days: Option<i64>,
    now: DateTime<Utc>,
) -> bool {
    let window = days.map(Duration::days);
    match operator {
        DateOperator::Before => value.map(|v| at < v).unwrap_or(false),
        DateOperator::After => value.map(|v| at > v).unwrap_or(false),
        DateOperator::On => value.map(|v| at.date_naive() == v.date_naive()).unwrap_or(false),
        DateOperator::WithinLastDays => window.map(|w| at <= now && at >= now - w).unwrap_or(false),
        DateOperator::WithinNextDays => window.map(|w| at >= now && at <= now + w).unwrap_or(false),
        DateOperator::OlderThanDays => window.map(|w| at < now - w).unwrap_or(false),
    }
}

fn engagement_matches(
    contact: &ContactSnapshot,
    kind: EngagementKind,
    campaign_id: Option<&str>,
    within_days: Option<i64>,
    now: DateTime<Utc>,
) -> bool {
    let engagement = &contact.engagement;
    let recent = |at: Option<DateTime<Utc>>| match within_days {
        Some(days) => at.map(|t| t >= now - Duration::days(days)).unwrap_or(false),
        None => true,
    };

    let opened = match campaign_id {
        Some(id) => engagement.opened_campaigns.iter().any(|c| c == id),
        None => engagement.total_opens > 0,
    } && recent(engagement.last_opened_at);

    let clicked = match campaign_id {
        Some(id) => engagement.clicked_campaigns.iter().any(|c| c == id),
        None => engagement.total_clicks > 0,
    } && recent(engagement.last_clicked_at);

    match kind {
        EngagementKind::Opened => opened,
        EngagementKind::Clicked => clicked,
        EngagementKind::NotOpened => !opened,
        EngagementKind::NotClicked => !clicked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn contact() -> ContactSnapshot {
        ContactSnapshot::new(Uuid::now_v7(), Uuid::now_v7())
            .with_field("email", "jane@example.com")
            .with_field("lead_score", 72)
            .with_field("signup_date", "2026-01-15T10:00:00Z")
            .with_custom_field("industry", "Retail")
            .with_tag("lead")
            .with_tag("newsletter")
            .with_stage("sales", "qualified")
    }

    fn eval(spec: &ConditionSpec) -> bool {
        let c = contact();
        let now = DateTime::parse_from_rfc3339("2026-02-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        evaluate(spec, &EvaluationContext::new(&c, now)).matched
    }

    #[test]
    fn test_field_equals() {
        assert!(eval(&ConditionSpec::field_equals("email", "JANE@example.com")));
        assert!(!eval(&ConditionSpec::field_equals("email", "bob@example.com")));
        assert!(!eval(&ConditionSpec::field_equals("missing", "x")));
    }

    #[test]
    fn test_field_operator() {
        let spec = ConditionSpec::ContactField {
            field: "lead_score".into(),
            operator: Operator::GreaterOrEqual,
            value: Some(json!(70)),
        };
        assert!(eval(&spec));

        let custom = ConditionSpec::CustomField {
            field: "industry".into(),
            operator: Operator::In,
            value: Some(json!(["retail", "hospitality"])),
        };
        assert!(eval(&custom));
    }

    #[test]
    fn test_tag_match_modes() {
        let tags = |mode| ConditionSpec::ContactHasTag {
            tag: None,
            tags: vec!["lead".into(), "customer".into()],
            match_mode: mode,
        };
        assert!(eval(&tags(TagMatch::Any)));
        assert!(!eval(&tags(TagMatch::All)));
        assert!(!eval(&tags(TagMatch::None)));
        assert!(eval(&ConditionSpec::has_tag("LEAD")));
    }

    #[test]
    fn test_pipeline_stage() {
        assert!(eval(&ConditionSpec::PipelineStage {
            pipeline_id: "sales".into(),
            stage_ids: vec![],
        }));
        assert!(eval(&ConditionSpec::PipelineStage {
            pipeline_id: "sales".into(),
            stage_ids: vec!["proposal".into(), "qualified".into()],
        }));
        assert!(!eval(&ConditionSpec::PipelineStage {
            pipeline_id: "onboarding".into(),
            stage_ids: vec![],
        }));
    }

    #[test]
    fn test_date_comparison() {
        let within = |days| ConditionSpec::DateComparison {
            field: "signup_date".into(),
            operator: DateOperator::WithinLastDays,
            value: None,
            days: Some(days),
        };
        assert!(eval(&within(30)));
        assert!(!eval(&within(7)));

        let older = ConditionSpec::DateComparison {
            field: "signup_date".into(),
            operator: DateOperator::OlderThanDays,
            value: None,
            days: Some(7),
        };
        assert!(eval(&older));
    }

    #[test]
    fn test_engagement() {
        let c = contact();
        let mut engaged = c.clone();
        engaged.engagement.opened_campaigns.push("spring".into());
        engaged.engagement.total_opens = 1;
        let now = Utc::now();

        let opened = ConditionSpec::EmailEngagement {
            engagement: EngagementKind::Opened,
            campaign_id: Some("spring".into()),
            within_days: None,
        };
        assert!(evaluate(&opened, &EvaluationContext::new(&engaged, now)).matched);
        assert!(!evaluate(&opened, &EvaluationContext::new(&c, now)).matched);

        let not_clicked = ConditionSpec::EmailEngagement {
            engagement: EngagementKind::NotClicked,
            campaign_id: None,
            within_days: None,
        };
        assert!(evaluate(&not_clicked, &EvaluationContext::new(&engaged, now)).matched);
    }

    #[test]
    fn test_composites() {
        let all = ConditionSpec::All {
            conditions: vec![
                ConditionSpec::has_tag("lead"),
                ConditionSpec::field_equals("email", "jane@example.com"),
            ],
        };
        let any = ConditionSpec::Any {
            conditions: vec![
                ConditionSpec::has_tag("vip"),
                ConditionSpec::has_tag("newsletter"),
            ],
        };
        assert!(eval(&all));
        assert!(eval(&any));
    }

    #[test]
    fn test_details_record_comparison() {
        let c = contact();
        let result = evaluate(
            &ConditionSpec::field_equals("email", "jane@example.com"),
            &EvaluationContext::new(&c, Utc::now()),
        );
        assert_eq!(result.details["field"], json!("email"));
        assert_eq!(result.details["actual"], json!("jane@example.com"));
    }
}
