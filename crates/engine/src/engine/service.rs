//! Engine facade
//!
//! [`WorkflowEngine`] wires the stepper, schedulers, bulk processor and
//! migration coordinator over one store and one set of collaborators. It is
//! what the worker pool and the API layer talk to.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::enrollment::{EnrollRequest, Enroller};
use super::error::EngineError;
use super::stepper::{close_open_work, ExecutionOutcome, Stepper};
use crate::bulk::BulkEnrollmentProcessor;
use crate::collaborators::{ActionDispatcher, ContactStore, DefinitionStore};
use crate::config::EngineConfig;
use crate::definition::WorkflowDefinition;
use crate::events::InboundEvent;
use crate::migration::{BatchReport, MigrationCoordinator, MigrationPlan};
use crate::model::{
    ActionExecution, BulkEnrollmentBatch, BulkEnrollmentFailure, BulkEnrollmentJob,
    BulkEnrollmentOptions, ConditionLog, ContactSelection, EnrollmentSource, ExecutionStatus,
    JobProgress, ListenerStatus, MappingRules, MigrationStrategy, VersionMigration, WaitExecution,
    WaitStatus, WorkflowExecution, WorkflowVersion,
};
use crate::persistence::{EngineStore, StoreError};
use crate::scheduler::{TriggerMatcher, WaitScheduler};

/// Point-in-time view of one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub execution: WorkflowExecution,
    pub current_action: Option<ActionExecution>,
    pub open_wait: Option<WaitExecution>,
    pub actions: Vec<ActionExecution>,
    pub condition_logs: Vec<ConditionLog>,
}

/// What an inbound event did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventOutcome {
    /// Executions completed because the event achieved a goal
    pub goals_achieved: Vec<Uuid>,
    /// Waits the event made due
    pub waits_resumed: Vec<Uuid>,
    /// Executions created by matching triggers
    pub enrolled: Vec<Uuid>,
}

pub struct WorkflowEngine {
    store: Arc<dyn EngineStore>,
    config: Arc<EngineConfig>,
    enroller: Arc<Enroller>,
    stepper: Stepper,
    waits: Arc<WaitScheduler>,
    triggers: TriggerMatcher,
    bulk: BulkEnrollmentProcessor,
    migrations: MigrationCoordinator,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn EngineStore>,
        definitions: Arc<dyn DefinitionStore>,
        contacts: Arc<dyn ContactStore>,
        dispatcher: Arc<dyn ActionDispatcher>,
        config: EngineConfig,
    ) -> Self {
        let config = Arc::new(config);
        let waits = Arc::new(WaitScheduler::new(store.clone()));
        let enroller = Arc::new(Enroller::new(store.clone(), definitions.clone(), contacts.clone()));
        let stepper = Stepper::new(
            store.clone(),
            definitions.clone(),
            contacts.clone(),
            dispatcher,
            waits.clone(),
            config.clone(),
        );
        let triggers = TriggerMatcher::new(store.clone(), definitions.clone());
        let bulk = BulkEnrollmentProcessor::new(
            store.clone(),
            definitions.clone(),
            contacts,
            enroller.clone(),
            config.bulk.clone(),
        );
        let migrations = MigrationCoordinator::new(
            store.clone(),
            definitions,
            config.migration.clone(),
            config.worker_id.clone(),
        );

        Self {
            store,
            config,
            enroller,
            stepper,
            waits,
            triggers,
            bulk,
            migrations,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    // =========================================================================
    // Executions
    // =========================================================================

    pub async fn enroll(&self, request: EnrollRequest) -> Result<WorkflowExecution, EngineError> {
        self.enroller.enroll(request).await
    }

    /// Claim an execution and advance it as far as it will go
    #[instrument(skip(self))]
    pub async fn run_execution(&self, execution_id: Uuid) -> Result<ExecutionOutcome, EngineError> {
        let claim = self.stepper.claim(execution_id).await?;
        self.stepper.drive(claim, None).await
    }

    /// Cancel a non-terminal execution
    ///
    /// Takes effect without the lease; a worker holding it notices at its next
    /// save and stops.
    #[instrument(skip(self, reason))]
    pub async fn cancel_execution(
        &self,
        execution_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<WorkflowExecution, EngineError> {
        let now = Utc::now();
        let cancelled = self
            .store
            .transition_execution(
                execution_id,
                &ExecutionStatus::NON_TERMINAL,
                ExecutionStatus::Cancelled,
                Some(reason.into()),
                now,
            )
            .await?;

        let Some(execution) = cancelled else {
            let execution = self.store.get_execution(execution_id).await?;
            return Err(EngineError::ExecutionTerminal {
                execution_id,
                status: execution.status,
            });
        };

        close_open_work(&self.store, &self.waits, execution_id, ExecutionStatus::Cancelled, now).await?;
        self.store
            .adjust_active_executions(execution.workflow_id, execution.workflow_version, -1)
            .await?;
        info!(%execution_id, "execution cancelled");
        Ok(execution)
    }

    /// Retry an execution
    ///
    /// An active execution parked on an action retry becomes runnable now. A
    /// failed execution is left as is and a new execution is enrolled at the
    /// node it failed on, pinned to the same version.
    #[instrument(skip(self))]
    pub async fn retry_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, EngineError> {
        let execution = self.store.get_execution(execution_id).await?;
        match execution.status {
            ExecutionStatus::Active => {
                let claim = self.stepper.claim(execution_id).await?;
                self.stepper.expedite(claim).await
            }
            ExecutionStatus::Failed => {
                let Some(node_id) = execution.current_node_id.clone() else {
                    return Err(EngineError::InvalidExecutionState {
                        execution_id,
                        status: execution.status,
                        expected: "failed at a node",
                    });
                };
                let mut metadata = match &execution.metadata {
                    Value::Object(map) => map.clone(),
                    _ => serde_json::Map::new(),
                };
                metadata.insert("retry_of".to_string(), json!(execution_id));

                let request = EnrollRequest::new(execution.workflow_id, execution.contact_id, EnrollmentSource::Manual)
                    .with_metadata(Value::Object(metadata))
                    .at_version(execution.workflow_version)
                    .starting_at(node_id);
                let retry = self.enroller.enroll(request).await?;
                info!(%execution_id, retry_id = %retry.id, "failed execution re-enrolled");
                Ok(retry)
            }
            status => Err(EngineError::InvalidExecutionState {
                execution_id,
                status,
                expected: "active or failed",
            }),
        }
    }

    pub async fn get_execution_status(&self, execution_id: Uuid) -> Result<ExecutionReport, EngineError> {
        let execution = self.store.get_execution(execution_id).await?;
        let current_action = self.store.open_action_execution(execution_id).await?;
        let open_wait = self.store.open_wait_for_execution(execution_id).await?;
        let actions = self.store.list_action_executions(execution_id).await?;
        let condition_logs = self.store.list_condition_logs(execution_id).await?;

        Ok(ExecutionReport {
            execution,
            current_action,
            open_wait,
            actions,
            condition_logs,
        })
    }

    /// Executions due to run now
    pub async fn runnable_executions(&self, limit: usize) -> Result<Vec<Uuid>, EngineError> {
        Ok(self.store.list_runnable(Utc::now(), limit).await?)
    }

    // =========================================================================
    // Events and waits
    // =========================================================================

    /// Route an inbound event to goals, waiting executions and triggers
    ///
    /// Work that cannot be done now (an execution leased elsewhere) is left to
    /// the scanners. A goal check that fails is logged and skipped for that
    /// execution only; other store failures are returned as errors.
    #[instrument(skip(self, event), fields(event_type = %event.event_type, contact_id = %event.contact_id))]
    pub async fn handle_event(&self, event: &InboundEvent) -> Result<EventOutcome, EngineError> {
        let mut outcome = EventOutcome::default();

        for execution in self
            .store
            .list_open_executions_for_contact(event.account_id, event.contact_id)
            .await?
        {
            match self.apply_goal_event(execution.id, event).await {
                Ok(true) => outcome.goals_achieved.push(execution.id),
                Ok(false) => {}
                Err(e) => {
                    warn!(execution_id = %execution.id, error = %e, "goal check failed");
                }
            }
        }

        for wait in self.waits.match_event(event, Utc::now()).await? {
            outcome.waits_resumed.push(wait.id);
            if let Err(e) = self.process_due_wait(&wait).await {
                debug!(wait_id = %wait.id, error = %e, "due wait left for the scanner");
            }
        }

        for definition in self.triggers.candidates(event).await? {
            if let Some(execution) = self.enroll_from_trigger(&definition, event).await? {
                outcome.enrolled.push(execution.id);
            }
        }

        info!(
            goals = outcome.goals_achieved.len(),
            waits = outcome.waits_resumed.len(),
            enrolled = outcome.enrolled.len(),
            "event handled"
        );
        Ok(outcome)
    }

    async fn apply_goal_event(&self, execution_id: Uuid, event: &InboundEvent) -> Result<bool, EngineError> {
        let mut claim = match self.stepper.claim(execution_id).await {
            Ok(claim) => claim,
            Err(e) if e.is_retryable() || e.kind() == super::error::ErrorKind::Precondition => {
                debug!(%execution_id, error = %e, "skipping goal check");
                return Ok(false);
            }
            Err(EngineError::ExecutionTerminal { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        let result = self.stepper.apply_event_goals(&mut claim, event).await;
        self.stepper.release(&claim.lease).await;
        Ok(matches!(result?, Some(outcome) if outcome.is_terminal()))
    }

    async fn enroll_from_trigger(
        &self,
        definition: &WorkflowDefinition,
        event: &InboundEvent,
    ) -> Result<Option<WorkflowExecution>, EngineError> {
        let mut metadata = json!({
            "trigger_event_id": event.id,
            "trigger_event_type": event.event_type,
            "trigger_data": event.data,
        });
        if let Some(correlation_id) = &event.correlation_id {
            metadata["correlation_id"] = json!(correlation_id);
        }

        let request = EnrollRequest::new(definition.workflow_id, event.contact_id, EnrollmentSource::Trigger)
            .with_metadata(metadata)
            .at_version(definition.version);
        match self.enroller.enroll(request).await {
            Ok(execution) => Ok(Some(execution)),
            Err(e) if e.is_per_contact() || e.kind() == super::error::ErrorKind::Precondition => {
                debug!(workflow_id = %definition.workflow_id, error = %e, "trigger did not enroll");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Resume the execution behind a due wait and advance it
    ///
    /// `Ok(None)` when there was nothing to resume.
    #[instrument(skip(self, wait), fields(wait_id = %wait.id, execution_id = %wait.workflow_execution_id))]
    pub async fn process_due_wait(&self, wait: &WaitExecution) -> Result<Option<ExecutionOutcome>, EngineError> {
        let mut claim = match self.stepper.claim(wait.workflow_execution_id).await {
            Ok(claim) => claim,
            Err(EngineError::ExecutionTerminal { .. }) => {
                // the execution ended without closing this wait
                self.waits.cancel_for_execution(wait.workflow_execution_id, Utc::now()).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match self.stepper.resume(&mut claim, wait).await {
            Ok(true) => self.stepper.drive(claim, None).await.map(Some),
            Ok(false) => {
                self.stepper.release(&claim.lease).await;
                Ok(None)
            }
            Err(e) => {
                self.stepper.release(&claim.lease).await;
                Err(e)
            }
        }
    }

    /// Resume an open wait on behalf of an operator
    #[instrument(skip(self))]
    pub async fn resume_wait(&self, wait_id: Uuid) -> Result<Option<ExecutionOutcome>, EngineError> {
        let resumed = self
            .waits
            .manual_resume(wait_id, Utc::now())
            .await
            .map_err(|e| match e {
                StoreError::ListenerNotFound(_) => EngineError::ListenerNotFound(wait_id),
                e => e.into(),
            })?;
        let Some(wait) = resumed else {
            let wait = self.store.get_wait(wait_id).await?;
            if wait.status == WaitStatus::Waiting {
                if let Some(listener) = self.store.find_listener_for_wait(wait_id).await? {
                    if listener.status == ListenerStatus::Expired {
                        return Err(EngineError::ListenerExpired(listener.id));
                    }
                }
            }
            return Err(EngineError::WaitExpired(wait_id));
        };
        self.process_due_wait(&wait).await
    }

    pub async fn due_waits(&self, limit: usize) -> Result<Vec<WaitExecution>, EngineError> {
        Ok(self.waits.due_waits(Utc::now(), limit).await?)
    }

    /// Expire listeners past their timeout; returns the waits made due
    pub async fn expire_listeners(&self, limit: usize) -> Result<Vec<WaitExecution>, EngineError> {
        Ok(self.waits.expire_listeners(Utc::now(), limit).await?)
    }

    // =========================================================================
    // Bulk enrollment
    // =========================================================================

    pub async fn create_bulk_job(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        selection: ContactSelection,
        options: BulkEnrollmentOptions,
    ) -> Result<BulkEnrollmentJob, EngineError> {
        self.bulk.create(account_id, workflow_id, selection, options).await
    }

    pub async fn run_bulk_job(&self, job_id: Uuid) -> Result<BulkEnrollmentJob, EngineError> {
        self.bulk.run_job(job_id).await
    }

    pub async fn process_bulk_batch(&self, batch_id: Uuid) -> Result<BulkEnrollmentBatch, EngineError> {
        self.bulk.process_batch(batch_id).await
    }

    pub async fn retry_bulk_batch(&self, batch_id: Uuid) -> Result<BulkEnrollmentBatch, EngineError> {
        self.bulk.retry_batch(batch_id).await
    }

    pub async fn cancel_bulk_job(&self, job_id: Uuid) -> Result<BulkEnrollmentJob, EngineError> {
        self.bulk.cancel(job_id).await
    }

    pub async fn get_job_progress(&self, job_id: Uuid) -> Result<JobProgress, EngineError> {
        self.bulk.progress(job_id).await
    }

    pub async fn list_job_failures(&self, job_id: Uuid) -> Result<Vec<BulkEnrollmentFailure>, EngineError> {
        self.bulk.failures(job_id).await
    }

    pub async fn list_job_batches(&self, job_id: Uuid) -> Result<Vec<BulkEnrollmentBatch>, EngineError> {
        self.bulk.batches(job_id).await
    }

    // =========================================================================
    // Versions and migrations
    // =========================================================================

    pub async fn create_version(
        &self,
        definition: WorkflowDefinition,
        change_summary: Option<String>,
    ) -> Result<WorkflowVersion, EngineError> {
        self.migrations.create_version(definition, change_summary).await
    }

    pub async fn publish_version(
        &self,
        version_id: Uuid,
        plan: Option<MigrationPlan>,
    ) -> Result<(WorkflowVersion, Option<VersionMigration>), EngineError> {
        self.migrations.publish_version(version_id, plan).await
    }

    /// Stop a workflow; its executions are cancelled when next claimed
    pub async fn deactivate_workflow(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        self.store.deactivate_workflow(workflow_id, Utc::now()).await?;
        warn!(%workflow_id, "workflow deactivated");
        Ok(())
    }

    pub async fn create_migration(
        &self,
        workflow_id: Uuid,
        source_version: u32,
        target_version: u32,
        rules: MappingRules,
        strategy: MigrationStrategy,
        batch_size: Option<usize>,
    ) -> Result<VersionMigration, EngineError> {
        self.migrations
            .migrate(workflow_id, source_version, target_version, rules, strategy, batch_size)
            .await
    }

    pub async fn migrate_next_batch(&self, migration_id: Uuid) -> Result<BatchReport, EngineError> {
        self.migrations.migrate_next_batch(migration_id).await
    }

    pub async fn cancel_migration(&self, migration_id: Uuid) -> Result<VersionMigration, EngineError> {
        self.migrations.cancel_migration(migration_id).await
    }

    pub async fn refresh_migration(&self, migration_id: Uuid) -> Result<VersionMigration, EngineError> {
        self.migrations.refresh_migration(migration_id).await
    }

    pub async fn get_migration(&self, migration_id: Uuid) -> Result<VersionMigration, EngineError> {
        self.migrations.get_migration(migration_id).await
    }
}
