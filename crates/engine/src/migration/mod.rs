//! Version migration
//!
//! Moves in-flight executions from one workflow version's graph to another's.
//! The node pointer is remapped through admin-supplied [`MappingRules`]; an
//! execution whose node cannot be mapped stays on its source version and is
//! recorded in the migration's error log.
//!
//! - [`remap`] - pure pointer translation
//! - [`MigrationCoordinator`] - version lifecycle and batch migration
//! - `migrate_at_boundary` - the hook the stepper calls for gradual migrations

mod coordinator;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::collaborators::DefinitionStore;
use crate::definition::{NodeId, NodeKind, WorkflowDefinition};
use crate::engine::EngineError;
use crate::model::{
    ExecutionStatus, MappingRules, MigrationErrorEntry, MigrationStatus, MigrationStrategy,
    VersionMigration, WorkflowExecution,
};
use crate::persistence::{EngineStore, Lease};

pub use coordinator::{BatchReport, MigrationCoordinator, MigrationPlan};

/// Target node for an execution's current position
///
/// A queued execution still at the source entry moves to the target entry.
/// A waiting execution may only land on a wait node, since its open wait
/// keeps running after the move.
pub fn remap(
    execution: &WorkflowExecution,
    rules: &MappingRules,
    source: &WorkflowDefinition,
    target: &WorkflowDefinition,
) -> Result<Option<NodeId>, EngineError> {
    let Some(current) = execution.current_node_id.as_deref() else {
        return Ok(None);
    };

    if execution.status == ExecutionStatus::Queued
        && source.entry_node_id.as_deref() == Some(current)
        && !rules.node_map.contains_key(current)
    {
        return Ok(target.entry_node_id.clone());
    }

    let mapped = rules
        .resolve(current, target)
        .ok_or_else(|| EngineError::NoMapping {
            execution_id: execution.id,
            node_id: current.to_string(),
        })?;

    let Some(node) = target.node(&mapped) else {
        return Err(EngineError::IncompatibleNode {
            execution_id: execution.id,
            target: mapped,
            reason: format!("not a node of version {}", target.version),
        });
    };

    if execution.status == ExecutionStatus::Waiting && !matches!(node.kind, NodeKind::Wait(_)) {
        return Err(EngineError::IncompatibleNode {
            execution_id: execution.id,
            target: mapped,
            reason: format!("waiting execution cannot move to a {} node", node.kind.node_type()),
        });
    }

    Ok(Some(mapped))
}

/// Move a leased execution to the migration's target version
pub(crate) async fn apply(
    store: &Arc<dyn EngineStore>,
    lease: &Lease,
    migration: &VersionMigration,
    execution: &mut WorkflowExecution,
    target_node: Option<NodeId>,
) -> Result<(), EngineError> {
    let from_node = execution.current_node_id.clone();
    execution.workflow_version = migration.target_version;
    execution.current_node_id = target_node;
    execution.updated_at = Utc::now();
    store.save_execution(lease, execution).await?;

    store
        .adjust_active_executions(migration.workflow_id, migration.source_version, -1)
        .await?;
    store
        .adjust_active_executions(migration.workflow_id, migration.target_version, 1)
        .await?;

    debug!(
        execution_id = %execution.id,
        migration_id = %migration.id,
        from_node = ?from_node,
        to_node = ?execution.current_node_id,
        "execution migrated"
    );
    Ok(())
}

pub(crate) fn error_entry(execution: &WorkflowExecution, err: &EngineError) -> MigrationErrorEntry {
    MigrationErrorEntry {
        execution_id: execution.id,
        contact_id: execution.contact_id,
        node_id: execution.current_node_id.clone(),
        error_code: err.error_code().to_string(),
        message: err.to_string(),
        recorded_at: Utc::now(),
    }
}

/// Gradual migration of a leased execution at a step boundary
///
/// Returns the target definition when the execution moved. Executions that
/// already failed to map are left alone.
pub(crate) async fn migrate_at_boundary(
    store: &Arc<dyn EngineStore>,
    definitions: &Arc<dyn DefinitionStore>,
    lease: &Lease,
    execution: &mut WorkflowExecution,
    source: &WorkflowDefinition,
) -> Result<Option<Arc<WorkflowDefinition>>, EngineError> {
    let Some(migration) = store.active_migration(execution.workflow_id).await? else {
        return Ok(None);
    };
    if migration.strategy != MigrationStrategy::Gradual
        || migration.status != MigrationStatus::Running
        || migration.source_version != execution.workflow_version
        || migration.error_log.iter().any(|e| e.execution_id == execution.id)
    {
        return Ok(None);
    }

    let target = definitions
        .get(migration.workflow_id, migration.target_version)
        .await?;

    match remap(execution, &migration.mapping_rules, source, &target) {
        Ok(node) => {
            apply(store, lease, &migration, execution, node).await?;
            store
                .record_migration_progress(migration.id, 1, Vec::new(), None)
                .await?;
            settle(store, migration.id).await?;
            Ok(Some(target))
        }
        Err(err) => {
            warn!(
                execution_id = %execution.id,
                migration_id = %migration.id,
                error = %err,
                "execution left on source version"
            );
            store
                .record_migration_progress(migration.id, 0, vec![error_entry(execution, &err)], None)
                .await?;
            settle(store, migration.id).await?;
            Ok(None)
        }
    }
}

/// Complete a running migration once nothing migratable is left on the
/// source version
pub(crate) async fn settle(
    store: &Arc<dyn EngineStore>,
    migration_id: uuid::Uuid,
) -> Result<VersionMigration, EngineError> {
    let migration = store.get_migration(migration_id).await?;
    if migration.status != MigrationStatus::Running {
        return Ok(migration);
    }

    let remaining = store
        .count_in_flight(migration.workflow_id, migration.source_version)
        .await?;
    let done = if remaining == 0 {
        true
    } else if remaining <= migration.error_log.len() {
        let left = store
            .list_in_flight(migration.workflow_id, migration.source_version, None, remaining)
            .await?;
        left.iter()
            .all(|e| migration.error_log.iter().any(|f| f.execution_id == e.id))
    } else {
        false
    };
    if !done {
        return Ok(migration);
    }

    let completed = store
        .transition_migration(
            migration.id,
            &[MigrationStatus::Running],
            MigrationStatus::Completed,
            None,
            Utc::now(),
        )
        .await?;
    match completed {
        Some(migration) => {
            info!(
                migration_id = %migration.id,
                migrated = migration.contacts_migrated,
                failed = migration.contacts_failed,
                "migration completed"
            );
            Ok(migration)
        }
        None => Ok(store.get_migration(migration.id).await?),
    }
}
