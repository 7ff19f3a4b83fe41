//! Workflow versions and version migrations

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::{NodeId, WorkflowDefinition};

/// Highest version number a workflow may reach
pub const MAX_VERSION_NUMBER: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Draft,
    Active,
    Archived,
}

string_enum!(VersionStatus {
    Draft => "draft",
    Active => "active",
    Archived => "archived",
});

/// Published or draft snapshot of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub account_id: Uuid,
    pub version_number: u32,
    pub status: VersionStatus,
    /// At most one current version per workflow
    pub is_current: bool,
    pub definition: WorkflowDefinition,
    pub active_executions: i64,
    pub change_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl WorkflowVersion {
    pub fn draft(definition: WorkflowDefinition, change_summary: Option<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id: definition.workflow_id,
            account_id: definition.account_id,
            version_number: definition.version,
            status: VersionStatus::Draft,
            is_current: false,
            definition,
            active_executions: 0,
            change_summary,
            created_at: Utc::now(),
            published_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStrategy {
    /// Remap every in-flight execution now
    Immediate,
    /// Remap executions as they reach a step boundary
    Gradual,
    /// Remap one admin-triggered batch at a time
    Manual,
}

string_enum!(MigrationStrategy {
    Immediate => "immediate",
    Gradual => "gradual",
    Manual => "manual",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

string_enum!(MigrationStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl MigrationStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, MigrationStatus::Pending | MigrationStatus::Running)
    }
}

/// Admin-supplied node mapping from the source graph to the target graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRules {
    #[serde(default)]
    pub node_map: BTreeMap<NodeId, NodeId>,
    /// Map nodes whose id also exists in the target graph
    #[serde(default)]
    pub auto_map_identical: bool,
}

impl MappingRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        self.node_map.insert(from.into(), to.into());
        self
    }

    pub fn auto_map_identical(mut self) -> Self {
        self.auto_map_identical = true;
        self
    }

    /// Target node for a source node, if any
    pub fn resolve(&self, source_node: &str, target: &WorkflowDefinition) -> Option<NodeId> {
        if let Some(mapped) = self.node_map.get(source_node) {
            return Some(mapped.clone());
        }
        if self.auto_map_identical && target.has_node(source_node) {
            return Some(source_node.to_string());
        }
        None
    }
}

/// Per-execution migration failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationErrorEntry {
    pub execution_id: Uuid,
    pub contact_id: Uuid,
    pub node_id: Option<NodeId>,
    pub error_code: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMigration {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub source_version_id: Uuid,
    pub target_version_id: Uuid,
    pub source_version: u32,
    pub target_version: u32,
    pub strategy: MigrationStrategy,
    pub mapping_rules: MappingRules,
    pub batch_size: usize,
    pub status: MigrationStatus,
    pub total_contacts: usize,
    pub contacts_migrated: usize,
    pub contacts_failed: usize,
    pub error_log: Vec<MigrationErrorEntry>,
    /// Last execution id handled by batch processing
    pub cursor: Option<Uuid>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl VersionMigration {
    pub fn new(
        source: &WorkflowVersion,
        target: &WorkflowVersion,
        strategy: MigrationStrategy,
        mapping_rules: MappingRules,
        batch_size: usize,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id: source.workflow_id,
            source_version_id: source.id,
            target_version_id: target.id,
            source_version: source.version_number,
            target_version: target.version_number,
            strategy,
            mapping_rules,
            batch_size,
            status: MigrationStatus::Pending,
            total_contacts: 0,
            contacts_migrated: 0,
            contacts_failed: 0,
            error_log: Vec::new(),
            cursor: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}
