//! Version lifecycle and batch migration of in-flight executions

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{apply, error_entry, remap, settle};
use crate::collaborators::DefinitionStore;
use crate::config::MigrationConfig;
use crate::definition::WorkflowDefinition;
use crate::engine::EngineError;
use crate::model::{
    MappingRules, MigrationErrorEntry, MigrationStatus, MigrationStrategy, VersionMigration,
    VersionStatus, WorkflowVersion, MAX_VERSION_NUMBER,
};
use crate::persistence::{EngineStore, LeaseOutcome, LeaseRequest, MigrationStart, StoreError};

/// How in-flight executions of the previous version should be moved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub strategy: MigrationStrategy,
    #[serde(default)]
    pub mapping_rules: MappingRules,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl MigrationPlan {
    pub fn new(strategy: MigrationStrategy, mapping_rules: MappingRules) -> Self {
        Self {
            strategy,
            mapping_rules,
            batch_size: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

/// Result of one migration batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub migrated: usize,
    pub failed: usize,
    /// Executions that finished or moved before they could be claimed
    pub skipped: usize,
    /// Executions leased elsewhere; the cursor stays before the first of them
    pub deferred: usize,
    /// Whether the migration reached a terminal status
    pub finished: bool,
}

enum Migrated {
    Moved,
    Skipped,
    Locked,
    Failed(MigrationErrorEntry),
}

pub struct MigrationCoordinator {
    store: Arc<dyn EngineStore>,
    definitions: Arc<dyn DefinitionStore>,
    config: MigrationConfig,
    worker_id: String,
}

impl MigrationCoordinator {
    pub fn new(
        store: Arc<dyn EngineStore>,
        definitions: Arc<dyn DefinitionStore>,
        config: MigrationConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            definitions,
            config,
            worker_id: worker_id.into(),
        }
    }

    // =========================================================================
    // Versions
    // =========================================================================

    /// Store a new draft version numbered after the latest one
    #[instrument(skip(self, definition), fields(workflow_id = %definition.workflow_id))]
    pub async fn create_version(
        &self,
        mut definition: WorkflowDefinition,
        change_summary: Option<String>,
    ) -> Result<WorkflowVersion, EngineError> {
        let latest = self
            .store
            .latest_version_number(definition.workflow_id)
            .await?
            .unwrap_or(0);
        let number = latest + 1;
        if number > MAX_VERSION_NUMBER {
            return Err(EngineError::VersionLimitReached {
                workflow_id: definition.workflow_id,
                max: MAX_VERSION_NUMBER,
            });
        }

        definition.version = number;
        definition.validate()?;

        let version = WorkflowVersion::draft(definition, change_summary);
        self.store.insert_version(&version).await?;
        info!(version_id = %version.id, version = number, "version created");
        Ok(version)
    }

    /// Make a version current, optionally migrating the previous version's
    /// in-flight executions
    ///
    /// The previous current version is archived and the migration registered
    /// in the same store operation.
    #[instrument(skip(self, plan))]
    pub async fn publish_version(
        &self,
        version_id: Uuid,
        plan: Option<MigrationPlan>,
    ) -> Result<(WorkflowVersion, Option<VersionMigration>), EngineError> {
        let version = self.store.get_version(version_id).await?;
        let previous = self.store.current_version(version.workflow_id).await?;

        let migration = match (plan, &previous) {
            (Some(plan), Some(previous)) if previous.id != version.id => Some(VersionMigration::new(
                previous,
                &version,
                plan.strategy,
                plan.mapping_rules,
                plan.batch_size.unwrap_or(self.config.default_batch_size),
            )),
            _ => None,
        };

        let published = match self
            .store
            .publish_version(version_id, migration.as_ref(), Utc::now())
            .await
        {
            Ok(published) => published,
            Err(StoreError::MigrationInProgress {
                workflow_id,
                migration_id,
            }) => {
                return Err(EngineError::MigrationInProgress {
                    workflow_id,
                    migration_id,
                })
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            workflow_id = %published.workflow_id,
            version = published.version_number,
            "version published"
        );

        let migration = match migration {
            Some(migration) => Some(self.start(migration.id).await?),
            None => None,
        };
        Ok((published, migration))
    }

    // =========================================================================
    // Migrations
    // =========================================================================

    /// Migrate executions from one published version to another
    #[instrument(skip(self, rules))]
    pub async fn migrate(
        &self,
        workflow_id: Uuid,
        source_version: u32,
        target_version: u32,
        rules: MappingRules,
        strategy: MigrationStrategy,
        batch_size: Option<usize>,
    ) -> Result<VersionMigration, EngineError> {
        if source_version == target_version {
            return Err(EngineError::InvalidMigration(format!(
                "source and target are both version {source_version}"
            )));
        }
        let source = self.store.get_version_by_number(workflow_id, source_version).await?;
        let target = self.store.get_version_by_number(workflow_id, target_version).await?;
        if target.status == VersionStatus::Draft {
            return Err(EngineError::InvalidMigration(format!(
                "target version {target_version} is not published"
            )));
        }

        let migration = VersionMigration::new(
            &source,
            &target,
            strategy,
            rules,
            batch_size.unwrap_or(self.config.default_batch_size).max(1),
        );
        if let MigrationStart::InProgress(migration_id) = self.store.try_start_migration(&migration).await? {
            return Err(EngineError::MigrationInProgress {
                workflow_id,
                migration_id,
            });
        }
        self.start(migration.id).await
    }

    /// Move a pending migration to running; immediate migrations run to the end
    async fn start(&self, migration_id: Uuid) -> Result<VersionMigration, EngineError> {
        let migration = self.store.get_migration(migration_id).await?;
        let total = self
            .store
            .count_in_flight(migration.workflow_id, migration.source_version)
            .await?;
        self.store.set_migration_total(migration.id, total).await?;

        let Some(migration) = self
            .store
            .transition_migration(
                migration.id,
                &[MigrationStatus::Pending],
                MigrationStatus::Running,
                None,
                Utc::now(),
            )
            .await?
        else {
            return Ok(self.store.get_migration(migration_id).await?);
        };

        info!(
            migration_id = %migration.id,
            strategy = %migration.strategy,
            source_version = migration.source_version,
            target_version = migration.target_version,
            total,
            "migration started"
        );

        if migration.strategy == MigrationStrategy::Immediate {
            self.run_to_idle(migration.id).await?;
        }
        settle(&self.store, migration.id).await
    }

    /// Process batches until one neither moves anything nor advances the cursor
    async fn run_to_idle(&self, migration_id: Uuid) -> Result<(), EngineError> {
        loop {
            let (report, advanced) = self.next_batch(migration_id).await?;
            if report.finished || (!advanced && report.migrated + report.failed + report.skipped == 0) {
                return Ok(());
            }
        }
    }

    /// Process the next batch of a running migration
    #[instrument(skip(self))]
    pub async fn migrate_next_batch(&self, migration_id: Uuid) -> Result<BatchReport, EngineError> {
        Ok(self.next_batch(migration_id).await?.0)
    }

    /// Batch report and whether the cursor moved
    async fn next_batch(&self, migration_id: Uuid) -> Result<(BatchReport, bool), EngineError> {
        let migration = self.store.get_migration(migration_id).await?;
        if migration.status != MigrationStatus::Running {
            return Err(EngineError::MigrationNotActive {
                migration_id,
                status: migration.status,
            });
        }

        let source = self
            .definitions
            .get(migration.workflow_id, migration.source_version)
            .await?;
        let target = self
            .definitions
            .get(migration.workflow_id, migration.target_version)
            .await?;

        let executions = self
            .store
            .list_in_flight(
                migration.workflow_id,
                migration.source_version,
                migration.cursor,
                migration.batch_size,
            )
            .await?;

        let mut report = BatchReport::default();
        let mut failures = Vec::new();
        let mut cursor = None;
        for execution in executions {
            let logged = migration.error_log.iter().any(|e| e.execution_id == execution.id);
            let outcome = if logged {
                None
            } else {
                Some(self.migrate_one(&migration, execution.id, &source, &target).await?)
            };
            match outcome {
                None => {}
                Some(Migrated::Moved) => report.migrated += 1,
                Some(Migrated::Skipped) => report.skipped += 1,
                Some(Migrated::Locked) => report.deferred += 1,
                Some(Migrated::Failed(entry)) => {
                    report.failed += 1;
                    failures.push(entry);
                }
            }
            if report.deferred == 0 {
                cursor = Some(execution.id);
            }
        }

        let advanced = cursor.is_some();
        if advanced || report.migrated > 0 || !failures.is_empty() {
            self.store
                .record_migration_progress(migration.id, report.migrated, failures, cursor)
                .await?;
        }
        let settled = settle(&self.store, migration.id).await?;
        report.finished = !settled.status.is_active();

        debug!(
            migration_id = %migration.id,
            migrated = report.migrated,
            failed = report.failed,
            skipped = report.skipped,
            deferred = report.deferred,
            "migration batch processed"
        );
        Ok((report, advanced))
    }

    /// Claim one execution and move it, backing off while another worker
    /// holds it; still held after the last attempt yields `Locked`
    async fn migrate_one(
        &self,
        migration: &VersionMigration,
        execution_id: Uuid,
        source: &WorkflowDefinition,
        target: &WorkflowDefinition,
    ) -> Result<Migrated, EngineError> {
        let attempts = self.config.claim_attempts.max(1);
        let mut lease = None;
        let mut holder = String::new();

        for attempt in 1..=attempts {
            let request = LeaseRequest {
                execution_id,
                owner: &self.worker_id,
                ttl: self.config.claim_backoff * 10,
                now: Utc::now(),
                start_limit: None,
            };
            match self.store.acquire_lease(request).await? {
                LeaseOutcome::Acquired(l) => {
                    lease = Some(l);
                    break;
                }
                LeaseOutcome::Terminal(_) => return Ok(Migrated::Skipped),
                LeaseOutcome::Held { owner, .. } => {
                    holder = owner;
                    if attempt < attempts {
                        tokio::time::sleep(self.config.claim_backoff * attempt).await;
                    }
                }
                LeaseOutcome::LimitReached { .. } => {}
            }
        }

        let Some(lease) = lease else {
            debug!(%execution_id, owner = %holder, "execution leased elsewhere, migration deferred");
            return Ok(Migrated::Locked);
        };
        let mut execution = self.store.get_execution(execution_id).await?;

        let result = if execution.is_terminal() || execution.workflow_version != migration.source_version {
            Ok(Migrated::Skipped)
        } else {
            match remap(&execution, &migration.mapping_rules, source, target) {
                Ok(node) => apply(&self.store, &lease, migration, &mut execution, node)
                    .await
                    .map(|_| Migrated::Moved),
                Err(err) => {
                    warn!(%execution_id, error = %err, "execution left on source version");
                    Ok(Migrated::Failed(error_entry(&execution, &err)))
                }
            }
        };

        if let Err(e) = self.store.release_lease(&lease).await {
            warn!(%execution_id, error = %e, "failed to release migration lease");
        }
        result
    }

    /// Stop a pending or running migration; executions already moved stay moved
    #[instrument(skip(self))]
    pub async fn cancel_migration(&self, migration_id: Uuid) -> Result<VersionMigration, EngineError> {
        let cancelled = self
            .store
            .transition_migration(
                migration_id,
                &[MigrationStatus::Pending, MigrationStatus::Running],
                MigrationStatus::Cancelled,
                Some("cancelled".to_string()),
                Utc::now(),
            )
            .await?;
        match cancelled {
            Some(migration) => {
                info!(%migration_id, migrated = migration.contacts_migrated, "migration cancelled");
                Ok(migration)
            }
            None => {
                let migration = self.store.get_migration(migration_id).await?;
                Err(EngineError::MigrationNotActive {
                    migration_id,
                    status: migration.status,
                })
            }
        }
    }

    /// Re-check whether a running migration has anything left to move
    ///
    /// An immediate migration that deferred leased executions picks them up
    /// again here.
    pub async fn refresh_migration(&self, migration_id: Uuid) -> Result<VersionMigration, EngineError> {
        let migration = self.store.get_migration(migration_id).await?;
        if migration.status == MigrationStatus::Running && migration.strategy == MigrationStrategy::Immediate {
            self.run_to_idle(migration_id).await?;
        }
        settle(&self.store, migration_id).await
    }

    pub async fn get_migration(&self, migration_id: Uuid) -> Result<VersionMigration, EngineError> {
        Ok(self.store.get_migration(migration_id).await?)
    }
}
