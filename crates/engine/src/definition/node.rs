//! Graph nodes

use serde::{Deserialize, Serialize};

use super::action::ActionKind;
use super::condition::ConditionSpec;
use super::wait::WaitConfig;

/// Node identifier, stable within one workflow version
pub type NodeId = String;

/// One node of the automation graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default)]
    pub name: Option<String>,
    pub kind: NodeKind,
    /// Successor for action and wait nodes; `None` ends the workflow
    #[serde(default)]
    pub next: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node_type", rename_all = "snake_case")]
pub enum NodeKind {
    Action(ActionNode),
    Condition(ConditionNode),
    Wait(WaitNode),
    /// Explicit end of the workflow
    Exit,
}

impl NodeKind {
    pub fn node_type(&self) -> &'static str {
        match self {
            NodeKind::Action(_) => "action",
            NodeKind::Condition(_) => "condition",
            NodeKind::Wait(_) => "wait",
            NodeKind::Exit => "exit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionNode {
    pub action: ActionKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the workflow and engine retry limit
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitNode {
    pub wait: WaitConfig,
    /// Successor when an event wait times out; falls back to `next`
    #[serde(default)]
    pub timeout_next_node_id: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchType {
    IfElse,
    MultiBranch,
    SplitTest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionNode {
    pub branch_type: BranchType,
    /// Node-level criteria, used by branches that carry none of their own
    #[serde(default)]
    pub configuration: Option<ConditionSpec>,
    pub branches: Vec<Branch>,
}

impl ConditionNode {
    pub fn condition_type(&self) -> &'static str {
        match (self.branch_type, &self.configuration) {
            (BranchType::SplitTest, _) => "split_test",
            (_, Some(spec)) => spec.condition_type(),
            (_, None) => self
                .branches
                .iter()
                .find_map(|b| b.criteria.as_ref())
                .map(ConditionSpec::condition_type)
                .unwrap_or("none"),
        }
    }

    /// Branches sorted by `branch_order`
    pub fn ordered_branches(&self) -> Vec<&Branch> {
        let mut branches: Vec<&Branch> = self.branches.iter().collect();
        branches.sort_by_key(|b| b.branch_order);
        branches
    }

    pub fn default_branch(&self) -> Option<&Branch> {
        self.branches.iter().find(|b| b.is_default)
    }

    /// Criteria a non-default branch is evaluated with
    pub fn criteria_for<'a>(&'a self, branch: &'a Branch) -> Option<&'a ConditionSpec> {
        branch.criteria.as_ref().or(self.configuration.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub branch_order: u32,
    #[serde(default)]
    pub is_default: bool,
    /// Share of contacts for split tests (0-100)
    #[serde(default)]
    pub percentage: Option<u8>,
    #[serde(default)]
    pub next_node_id: Option<NodeId>,
    #[serde(default)]
    pub criteria: Option<ConditionSpec>,
}

impl Branch {
    pub fn new(id: impl Into<String>, branch_order: u32) -> Self {
        Self {
            id: id.into(),
            name: None,
            branch_order,
            is_default: false,
            percentage: None,
            next_node_id: None,
            criteria: None,
        }
    }

    pub fn default_branch(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn with_criteria(mut self, criteria: ConditionSpec) -> Self {
        self.criteria = Some(criteria);
        self
    }

    pub fn with_percentage(mut self, percentage: u8) -> Self {
        self.percentage = Some(percentage);
        self
    }

    pub fn to(mut self, next_node_id: impl Into<NodeId>) -> Self {
        self.next_node_id = Some(next_node_id.into());
        self
    }
}
