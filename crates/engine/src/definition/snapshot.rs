//! Version-pinned workflow definition snapshot

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::goal::GoalConfig;
use super::node::{BranchType, Node, NodeId, NodeKind};
use super::DefinitionError;
use crate::criteria::FieldCriterion;

/// Trigger filter that starts new executions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub event_type: String,
    #[serde(default)]
    pub filters: Vec<FieldCriterion>,
    /// Allow a contact to enter again after a previous run finished
    #[serde(default)]
    pub allow_reentry: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl TriggerConfig {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            filters: Vec::new(),
            allow_reentry: false,
            is_active: true,
        }
    }

    pub fn with_filter(mut self, filter: FieldCriterion) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_reentry(mut self) -> Self {
        self.allow_reentry = true;
        self
    }
}

/// Per-workflow overrides of engine defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub max_execution_seconds: Option<u64>,
}

/// Immutable description of one workflow version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: Uuid,
    pub account_id: Uuid,
    pub version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub trigger: Option<TriggerConfig>,
    /// First node; `None` completes immediately
    #[serde(default)]
    pub entry_node_id: Option<NodeId>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub goals: Vec<GoalConfig>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl WorkflowDefinition {
    pub fn new(workflow_id: Uuid, account_id: Uuid, version: u32) -> Self {
        Self {
            workflow_id,
            account_id,
            version,
            name: String::new(),
            trigger: None,
            entry_node_id: None,
            nodes: Vec::new(),
            goals: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    /// Parse and validate a snapshot
    pub fn from_json(value: Value) -> Result<Self, DefinitionError> {
        let definition: WorkflowDefinition =
            serde_json::from_value(value).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn with_trigger(mut self, trigger: TriggerConfig) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_goal(mut self, goal: GoalConfig) -> Self {
        self.goals.push(goal);
        self
    }

    /// Append a node; the first node added becomes the entry node
    pub fn with_node(mut self, node: Node) -> Self {
        if self.entry_node_id.is_none() {
            self.entry_node_id = Some(node.id.clone());
        }
        self.nodes.push(node);
        self
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn has_node(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    pub fn active_goals(&self) -> impl Iterator<Item = &GoalConfig> {
        self.goals.iter().filter(|g| g.is_active)
    }

    /// All nodes reachable in one hop from `node`
    pub fn successors(node: &Node) -> Vec<&NodeId> {
        let mut out: Vec<&NodeId> = node.next.iter().collect();
        match &node.kind {
            NodeKind::Condition(condition) => {
                out.extend(condition.branches.iter().filter_map(|b| b.next_node_id.as_ref()));
            }
            NodeKind::Wait(wait) => out.extend(wait.timeout_next_node_id.iter()),
            NodeKind::Action(_) | NodeKind::Exit => {}
        }
        out
    }

    /// Structural validation done once at load time
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(DefinitionError::DuplicateNode(node.id.clone()));
            }
        }

        if let Some(entry) = &self.entry_node_id {
            if !ids.contains(entry.as_str()) {
                return Err(DefinitionError::MissingEntryNode(entry.clone()));
            }
        }

        for node in &self.nodes {
            for target in Self::successors(node) {
                if !ids.contains(target.as_str()) {
                    return Err(DefinitionError::DanglingReference {
                        from: node.id.clone(),
                        to: target.clone(),
                    });
                }
            }
            self.validate_node(node)?;
        }

        if let Some(trigger) = &self.trigger {
            if trigger.event_type.trim().is_empty() {
                return Err(DefinitionError::InvalidTrigger(
                    "event_type must not be empty".to_string(),
                ));
            }
            trigger
                .filters
                .iter()
                .try_for_each(FieldCriterion::validate)
                .map_err(DefinitionError::InvalidTrigger)?;
        }

        for goal in &self.goals {
            goal.validate().map_err(|reason| DefinitionError::InvalidGoal {
                goal_id: goal.id,
                reason,
            })?;
        }

        self.check_acyclic()
    }

    fn validate_node(&self, node: &Node) -> Result<(), DefinitionError> {
        match &node.kind {
            NodeKind::Action(action) => {
                action
                    .action
                    .validate()
                    .map_err(|reason| DefinitionError::InvalidAction {
                        node_id: node.id.clone(),
                        reason,
                    })
            }
            NodeKind::Wait(wait) => wait.wait.validate().map_err(|reason| {
                DefinitionError::InvalidWait {
                    node_id: node.id.clone(),
                    reason,
                }
            }),
            NodeKind::Condition(condition) => {
                let invalid = |reason: String| DefinitionError::InvalidCondition {
                    node_id: node.id.clone(),
                    reason,
                };

                let defaults = condition.branches.iter().filter(|b| b.is_default).count();
                if defaults != 1 {
                    return Err(invalid(format!(
                        "expected exactly one default branch, found {}",
                        defaults
                    )));
                }

                let mut orders = HashSet::new();
                for branch in &condition.branches {
                    if !orders.insert(branch.branch_order) {
                        return Err(invalid(format!(
                            "branch_order {} is used more than once",
                            branch.branch_order
                        )));
                    }
                }

                match condition.branch_type {
                    BranchType::SplitTest => {
                        let mut total: u32 = 0;
                        for branch in &condition.branches {
                            let pct = branch.percentage.ok_or_else(|| {
                                invalid(format!("split branch '{}' has no percentage", branch.id))
                            })?;
                            total += u32::from(pct);
                        }
                        if total != 100 {
                            return Err(invalid(format!(
                                "split percentages sum to {}, expected 100",
                                total
                            )));
                        }
                    }
                    BranchType::IfElse | BranchType::MultiBranch => {
                        if condition.branch_type == BranchType::IfElse
                            && condition.branches.len() != 2
                        {
                            return Err(invalid(format!(
                                "if_else needs exactly two branches, found {}",
                                condition.branches.len()
                            )));
                        }
                        if condition.branches.len() < 2 {
                            return Err(invalid("multi_branch needs at least two branches".into()));
                        }
                        for branch in condition.branches.iter().filter(|b| !b.is_default) {
                            let spec = condition.criteria_for(branch).ok_or_else(|| {
                                invalid(format!("branch '{}' has no criteria", branch.id))
                            })?;
                            spec.validate().map_err(|reason| {
                                invalid(format!("branch '{}': {}", branch.id, reason))
                            })?;
                        }
                    }
                }
                Ok(())
            }
            NodeKind::Exit => Ok(()),
        }
    }

    /// Reject graphs with cycles so every (execution, node) pair is visited once
    fn check_acyclic(&self) -> Result<(), DefinitionError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let index: HashMap<&str, &Node> = self.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        for start in &self.nodes {
            if marks.contains_key(start.id.as_str()) {
                continue;
            }
            // (node, next successor index)
            let mut stack: Vec<(&Node, usize)> = vec![(start, 0)];
            marks.insert(start.id.as_str(), Mark::Visiting);

            while let Some((node, cursor)) = stack.pop() {
                let successors = Self::successors(node);
                if cursor < successors.len() {
                    stack.push((node, cursor + 1));
                    let target = successors[cursor].as_str();
                    match marks.get(target) {
                        Some(Mark::Visiting) => {
                            return Err(DefinitionError::Cycle(target.to_string()))
                        }
                        Some(Mark::Done) => {}
                        None => {
                            if let Some(next) = index.get(target) {
                                marks.insert(target, Mark::Visiting);
                                stack.push((*next, 0));
                            }
                        }
                    }
                } else {
                    marks.insert(node.id.as_str(), Mark::Done);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::action::{ActionKind, SendEmailConfig};
    use crate::definition::condition::ConditionSpec;
    use crate::definition::node::{ActionNode, Branch, ConditionNode};
    use serde_json::json;

    fn email_node(id: &str, next: Option<&str>) -> Node {
        Node {
            id: id.into(),
            name: None,
            kind: NodeKind::Action(ActionNode {
                action: ActionKind::SendEmail(SendEmailConfig {
                    template_id: "welcome".into(),
                    subject: None,
                    from_name: None,
                }),
                enabled: true,
                max_retries: None,
            }),
            next: next.map(String::from),
        }
    }

    fn condition_node(id: &str, branch_type: BranchType, branches: Vec<Branch>) -> Node {
        Node {
            id: id.into(),
            name: None,
            kind: NodeKind::Condition(ConditionNode {
                branch_type,
                configuration: None,
                branches,
            }),
            next: None,
        }
    }

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new(Uuid::now_v7(), Uuid::now_v7(), 1)
    }

    #[test]
    fn test_valid_linear_definition() {
        let def = definition()
            .with_node(email_node("a", Some("b")))
            .with_node(email_node("b", None));

        assert_eq!(def.entry_node_id.as_deref(), Some("a"));
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_dangling_reference() {
        let def = definition().with_node(email_node("a", Some("missing")));

        assert_eq!(
            def.validate(),
            Err(DefinitionError::DanglingReference {
                from: "a".into(),
                to: "missing".into()
            })
        );
    }

    #[test]
    fn test_duplicate_node() {
        let def = definition()
            .with_node(email_node("a", None))
            .with_node(email_node("a", None));

        assert_eq!(def.validate(), Err(DefinitionError::DuplicateNode("a".into())));
    }

    #[test]
    fn test_cycle_rejected() {
        let def = definition()
            .with_node(email_node("a", Some("b")))
            .with_node(email_node("b", Some("a")));

        assert!(matches!(def.validate(), Err(DefinitionError::Cycle(_))));
    }

    #[test]
    fn test_condition_requires_one_default() {
        let def = definition().with_node(condition_node(
            "c",
            BranchType::IfElse,
            vec![
                Branch::new("yes", 0).with_criteria(ConditionSpec::has_tag("lead")),
                Branch::new("no", 1),
            ],
        ));

        assert!(matches!(
            def.validate(),
            Err(DefinitionError::InvalidCondition { .. })
        ));
    }

    #[test]
    fn test_split_percentages_must_sum_to_100() {
        let def = definition().with_node(condition_node(
            "split",
            BranchType::SplitTest,
            vec![
                Branch::new("a", 0).with_percentage(50),
                Branch::new("b", 1).with_percentage(30).default_branch(),
            ],
        ));
        assert!(def.validate().is_err());

        let def = definition().with_node(condition_node(
            "split",
            BranchType::SplitTest,
            vec![
                Branch::new("a", 0).with_percentage(50),
                Branch::new("b", 1).with_percentage(50).default_branch(),
            ],
        ));
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_from_json() {
        let workflow_id = Uuid::now_v7();
        let account_id = Uuid::now_v7();
        let def = WorkflowDefinition::from_json(json!({
            "workflow_id": workflow_id,
            "account_id": account_id,
            "version": 3,
            "trigger": {"event_type": "form_submitted"},
            "entry_node_id": "welcome",
            "nodes": [
                {
                    "id": "welcome",
                    "kind": {
                        "node_type": "action",
                        "action": {"action_type": "send_email", "config": {"template_id": "t1"}}
                    },
                    "next": "pause"
                },
                {
                    "id": "pause",
                    "kind": {"node_type": "wait", "wait": {"wait_type": "fixed_time", "duration_seconds": 60}}
                }
            ]
        }))
        .unwrap();

        assert_eq!(def.version, 3);
        assert!(def.trigger.as_ref().unwrap().is_active);
        assert_eq!(def.node("pause").unwrap().kind.node_type(), "wait");
    }

    #[test]
    fn test_from_json_rejects_unknown_action() {
        let result = WorkflowDefinition::from_json(json!({
            "workflow_id": Uuid::now_v7(),
            "account_id": Uuid::now_v7(),
            "version": 1,
            "nodes": [{
                "id": "x",
                "kind": {"node_type": "action", "action": {"action_type": "fax", "config": {}}}
            }]
        }));

        assert!(matches!(result, Err(DefinitionError::Parse(_))));
    }
}
