//! Condition evaluation and branch selection
//!
//! Pure functions over a contact snapshot. Nothing here performs I/O or
//! mutates the condition configuration; the stepper persists the returned
//! selection as a `ConditionLog`.

mod evaluator;
pub mod split;

use std::time::Instant;

use serde_json::{json, Value};

use crate::definition::{BranchType, ConditionNode, NodeId};

pub use evaluator::{evaluate, EvaluationContext, EvaluationResult};

/// Branch chosen at a condition node
#[derive(Debug, Clone, PartialEq)]
pub struct BranchSelection {
    pub branch_id: String,
    pub next_node_id: Option<NodeId>,
    /// Whether a non-default branch matched (split tests always match)
    pub matched: bool,
    pub details: Value,
    pub duration_micros: u64,
}

/// Select the outgoing branch of a condition node
///
/// If-else and multi-branch nodes take the first matching non-default branch
/// by `branch_order`, else the default branch. Split tests map a hash of the
/// contact id into the branches' cumulative percentages. `None` only when
/// the node has no default branch to fall back on.
pub fn select_branch(
    node_id: &str,
    condition: &ConditionNode,
    ctx: &EvaluationContext<'_>,
) -> Option<BranchSelection> {
    let started = Instant::now();
    let ordered = condition.ordered_branches();

    let (branch, matched, details) = match condition.branch_type {
        BranchType::SplitTest => {
            let bucket = split::bucket(node_id, ctx.contact.contact_id);
            let branch = split::pick(&ordered, bucket).or_else(|| condition.default_branch())?;
            (branch, true, json!({ "bucket": bucket }))
        }
        BranchType::IfElse | BranchType::MultiBranch => {
            let mut evaluated = Vec::new();
            let mut chosen = None;

            for branch in ordered.iter().filter(|b| !b.is_default) {
                let Some(spec) = condition.criteria_for(branch) else {
                    continue;
                };
                let result = evaluate(spec, ctx);
                evaluated.push(json!({ "branch_id": branch.id, "matched": result.matched, "details": result.details }));
                if result.matched {
                    chosen = Some(*branch);
                    break;
                }
            }

            match chosen {
                Some(branch) => (branch, true, json!({ "evaluated": evaluated })),
                None => (condition.default_branch()?, false, json!({ "evaluated": evaluated })),
            }
        }
    };

    Some(BranchSelection {
        branch_id: branch.id.clone(),
        next_node_id: branch.next_node_id.clone(),
        matched,
        details,
        duration_micros: started.elapsed().as_micros() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::ContactSnapshot;
    use crate::definition::{Branch, ConditionSpec};
    use chrono::Utc;
    use uuid::Uuid;

    fn lead_check() -> ConditionNode {
        ConditionNode {
            branch_type: BranchType::IfElse,
            configuration: Some(ConditionSpec::ContactField {
                field: "tags".into(),
                operator: crate::criteria::Operator::Contains,
                value: Some(json!("lead")),
            }),
            branches: vec![
                Branch::new("no", 1).default_branch().to("nurture"),
                Branch::new("yes", 0).to("sales_call"),
            ],
        }
    }

    #[test]
    fn test_if_else_takes_matching_branch() {
        let contact = ContactSnapshot::new(Uuid::now_v7(), Uuid::now_v7())
            .with_field("tags", json!(["lead"]))
            .with_tag("lead");
        let selection = select_branch("check", &lead_check(), &EvaluationContext::new(&contact, Utc::now())).unwrap();

        assert_eq!(selection.branch_id, "yes");
        assert_eq!(selection.next_node_id.as_deref(), Some("sales_call"));
        assert!(selection.matched);
    }

    #[test]
    fn test_if_else_falls_back_to_default() {
        let contact = ContactSnapshot::new(Uuid::now_v7(), Uuid::now_v7());
        let selection = select_branch("check", &lead_check(), &EvaluationContext::new(&contact, Utc::now())).unwrap();

        assert_eq!(selection.branch_id, "no");
        assert!(!selection.matched);
    }

    #[test]
    fn test_multi_branch_respects_order() {
        let node = ConditionNode {
            branch_type: BranchType::MultiBranch,
            configuration: None,
            branches: vec![
                Branch::new("vip", 2).with_criteria(ConditionSpec::has_tag("vip")).to("vip"),
                Branch::new("lead", 1).with_criteria(ConditionSpec::has_tag("lead")).to("lead"),
                Branch::new("other", 3).default_branch().to("other"),
            ],
        };
        let contact = ContactSnapshot::new(Uuid::now_v7(), Uuid::now_v7())
            .with_tag("vip")
            .with_tag("lead");

        let selection = select_branch("route", &node, &EvaluationContext::new(&contact, Utc::now())).unwrap();
        assert_eq!(selection.branch_id, "lead");
    }

    #[test]
    fn test_split_test_is_idempotent() {
        let node = ConditionNode {
            branch_type: BranchType::SplitTest,
            configuration: None,
            branches: vec![
                Branch::new("a", 0).with_percentage(50).default_branch().to("a"),
                Branch::new("b", 1).with_percentage(50).to("b"),
            ],
        };
        let contact = ContactSnapshot::new(Uuid::now_v7(), Uuid::now_v7());
        let ctx = EvaluationContext::new(&contact, Utc::now());

        let first = select_branch("split", &node, &ctx).unwrap();
        for _ in 0..20 {
            assert_eq!(select_branch("split", &node, &ctx).unwrap().branch_id, first.branch_id);
        }
    }

    #[test]
    fn test_evaluation_does_not_mutate_configuration() {
        let node = lead_check();
        let before = node.clone();
        let contact = ContactSnapshot::new(Uuid::now_v7(), Uuid::now_v7());
        let _ = select_branch("check", &node, &EvaluationContext::new(&contact, Utc::now()));
        assert_eq!(node, before);
    }
}
