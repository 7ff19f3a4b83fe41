//! Bulk enrollment
//!
//! A job resolves its contact selection once, partitions the contacts into
//! ordered batches and enrolls each batch independently. Batches record
//! per-contact outcomes as they go, so a retried batch never enrolls the
//! same contact twice. Job counters are always recomputed from the batches.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::collaborators::{CollaboratorError, ContactStore, DefinitionStore};
use crate::config::BulkConfig;
use crate::engine::{EngineError, EnrollRequest, Enroller};
use crate::model::{
    BatchStatus, BulkEnrollmentBatch, BulkEnrollmentFailure, BulkEnrollmentJob,
    BulkEnrollmentOptions, BulkJobStatus, ContactSelection, EnrollmentSource, JobCounters,
    JobProgress,
};
use crate::persistence::EngineStore;

/// Outcome of enrolling one contact of a batch
enum ContactOutcome {
    Enrolled,
    Skipped,
    Failed(EngineError),
}

pub struct BulkEnrollmentProcessor {
    store: Arc<dyn EngineStore>,
    definitions: Arc<dyn DefinitionStore>,
    contacts: Arc<dyn ContactStore>,
    enroller: Arc<Enroller>,
    config: BulkConfig,
}

impl BulkEnrollmentProcessor {
    pub fn new(
        store: Arc<dyn EngineStore>,
        definitions: Arc<dyn DefinitionStore>,
        contacts: Arc<dyn ContactStore>,
        enroller: Arc<Enroller>,
        config: BulkConfig,
    ) -> Self {
        Self {
            store,
            definitions,
            contacts,
            enroller,
            config,
        }
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Create a job, validate its selection and queue its batches
    ///
    /// A selection that cannot be resolved leaves the job `failed` with the
    /// reason; the job is returned either way.
    #[instrument(skip(self, selection, options))]
    pub async fn create(
        &self,
        account_id: Uuid,
        workflow_id: Uuid,
        selection: ContactSelection,
        mut options: BulkEnrollmentOptions,
    ) -> Result<BulkEnrollmentJob, EngineError> {
        options.batch_size = self.config.clamp_batch_size(options.batch_size);
        let job = BulkEnrollmentJob::new(account_id, workflow_id, selection, options);
        self.store.insert_job(&job).await?;

        self.transition(job.id, &[BulkJobStatus::Pending], BulkJobStatus::Validating, None)
            .await?;

        let contact_ids = match self.validate(&job).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "bulk job validation failed");
                self.transition(
                    job.id,
                    &[BulkJobStatus::Validating],
                    BulkJobStatus::Failed,
                    Some(err.to_string()),
                )
                .await?;
                return Ok(self.store.get_job(job.id).await?);
            }
        };

        let batches: Vec<BulkEnrollmentBatch> = contact_ids
            .chunks(job.batch_size)
            .enumerate()
            .map(|(i, chunk)| BulkEnrollmentBatch::new(job.id, i as u32 + 1, chunk.to_vec()))
            .collect();
        self.store.insert_batches(&batches).await?;

        let counters = JobCounters {
            total_contacts: contact_ids.len(),
            total_batches: batches.len(),
            ..JobCounters::default()
        };
        self.store.update_job_counters(job.id, &counters).await?;
        self.transition(job.id, &[BulkJobStatus::Validating], BulkJobStatus::Queued, None)
            .await?;

        info!(
            job_id = %job.id,
            contacts = counters.total_contacts,
            batches = counters.total_batches,
            batch_size = job.batch_size,
            "bulk job queued"
        );
        Ok(self.store.get_job(job.id).await?)
    }

    /// Resolve the selection to distinct contact ids, in selection order
    async fn validate(&self, job: &BulkEnrollmentJob) -> Result<Vec<Uuid>, EngineError> {
        if !self.definitions.is_workflow_active(job.workflow_id).await? {
            return Err(EngineError::WorkflowNotActive(job.workflow_id));
        }

        let resolved = self
            .contacts
            .resolve_selection(job.account_id, &job.selection)
            .await
            .map_err(|e| match e {
                CollaboratorError::Invalid(reason) => EngineError::InvalidSelection(reason),
                other => EngineError::Collaborator(other),
            })?;

        let mut seen = HashSet::new();
        let ids: Vec<Uuid> = resolved.into_iter().filter(|id| seen.insert(*id)).collect();
        if ids.is_empty() {
            return Err(EngineError::InvalidSelection(
                "selection resolved to no contacts".to_string(),
            ));
        }
        Ok(ids)
    }

    // =========================================================================
    // Processing
    // =========================================================================

    /// Run every batch of a job in order
    #[instrument(skip(self))]
    pub async fn run_job(&self, job_id: Uuid) -> Result<BulkEnrollmentJob, EngineError> {
        for batch in self.store.list_batches(job_id).await? {
            if self.store.get_job(job_id).await?.status.is_terminal() {
                break;
            }
            self.process_batch(batch.id).await?;
        }
        self.reconcile(job_id).await
    }

    /// Enroll the contacts of one batch
    ///
    /// Only a pending batch is claimed; any other batch is returned as is. A
    /// batch that fails systemically is attempted again up to the configured
    /// attempt count. Contacts with an outcome from an earlier attempt are
    /// not enrolled again.
    #[instrument(skip(self))]
    pub async fn process_batch(&self, batch_id: Uuid) -> Result<BulkEnrollmentBatch, EngineError> {
        let mut batch = self.process_batch_once(batch_id).await?;
        while batch.status == BatchStatus::Failed && batch.attempt_count < self.config.max_batch_attempts {
            debug!(%batch_id, attempt = batch.attempt_count, "retrying failed batch");
            if !self
                .store
                .transition_batch(batch_id, &[BatchStatus::Failed], BatchStatus::Pending)
                .await?
            {
                break;
            }
            batch = self.process_batch_once(batch_id).await?;
        }
        self.reconcile(batch.job_id).await?;
        Ok(batch)
    }

    async fn process_batch_once(&self, batch_id: Uuid) -> Result<BulkEnrollmentBatch, EngineError> {
        let batch = self.store.get_batch(batch_id).await?;
        let job = self.store.get_job(batch.job_id).await?;

        if job.status == BulkJobStatus::Cancelled {
            self.store
                .transition_batch(batch.id, &[BatchStatus::Pending], BatchStatus::Cancelled)
                .await?;
            return Ok(self.store.get_batch(batch_id).await?);
        }
        self.transition(job.id, &[BulkJobStatus::Queued], BulkJobStatus::Processing, None)
            .await?;

        let Some(mut batch) = self.store.claim_batch(batch_id, Utc::now()).await? else {
            return Ok(batch);
        };
        let metadata = batch_metadata(&job.options.metadata, job.id);

        let pending: Vec<Uuid> = batch
            .contact_ids
            .iter()
            .filter(|id| !batch.is_processed(id))
            .copied()
            .collect();

        for contact_id in pending {
            // cooperative cancellation between contacts
            if self.store.get_job(job.id).await?.status == BulkJobStatus::Cancelled {
                batch.status = BatchStatus::Cancelled;
                batch.completed_at = Some(Utc::now());
                self.store.save_batch(&batch).await?;
                info!(batch_id = %batch.id, "batch stopped, job cancelled");
                return Ok(batch);
            }

            match self.enroll_one(&job, contact_id, metadata.clone()).await {
                ContactOutcome::Enrolled => batch.success_ids.push(contact_id),
                ContactOutcome::Skipped => batch.skipped_ids.push(contact_id),
                ContactOutcome::Failed(err) if err.is_per_contact() => {
                    let failure = BulkEnrollmentFailure::new(&batch, contact_id, err.error_code(), err.to_string());
                    self.store.insert_failure(&failure).await?;
                    batch.failure_ids.push(contact_id);
                }
                ContactOutcome::Failed(err) => {
                    warn!(batch_id = %batch.id, %contact_id, error = %err, "batch failed");
                    batch.status = BatchStatus::Failed;
                    batch.error_message = Some(err.to_string());
                    batch.completed_at = Some(Utc::now());
                    self.store.save_batch(&batch).await?;
                    return Ok(batch);
                }
            }
            self.store.save_batch(&batch).await?;
        }

        batch.status = BatchStatus::Completed;
        batch.completed_at = Some(Utc::now());
        self.store.save_batch(&batch).await?;
        debug!(
            batch_id = %batch.id,
            batch_number = batch.batch_number,
            enrolled = batch.success_ids.len(),
            failed = batch.failure_ids.len(),
            skipped = batch.skipped_ids.len(),
            "batch completed"
        );
        Ok(batch)
    }

    async fn enroll_one(&self, job: &BulkEnrollmentJob, contact_id: Uuid, metadata: Value) -> ContactOutcome {
        let request = EnrollRequest::new(job.workflow_id, contact_id, EnrollmentSource::Bulk)
            .with_metadata(metadata);
        match self.enroller.enroll(request).await {
            Ok(_) => ContactOutcome::Enrolled,
            Err(EngineError::DuplicateEnrollment { .. }) if job.options.skip_duplicates => {
                ContactOutcome::Skipped
            }
            Err(err) => ContactOutcome::Failed(err),
        }
    }

    /// Put a failed batch back in the queue and process it
    #[instrument(skip(self))]
    pub async fn retry_batch(&self, batch_id: Uuid) -> Result<BulkEnrollmentBatch, EngineError> {
        let batch = self.store.get_batch(batch_id).await?;
        let job = self.store.get_job(batch.job_id).await?;
        if batch.status != BatchStatus::Failed || job.status == BulkJobStatus::Cancelled {
            return Err(EngineError::BatchNotRetryable {
                batch_id,
                status: batch.status,
            });
        }

        if !self
            .store
            .transition_batch(batch_id, &[BatchStatus::Failed], BatchStatus::Pending)
            .await?
        {
            let current = self.store.get_batch(batch_id).await?;
            return Err(EngineError::BatchNotRetryable {
                batch_id,
                status: current.status,
            });
        }
        self.transition(
            job.id,
            &[BulkJobStatus::Failed, BulkJobStatus::Completed],
            BulkJobStatus::Processing,
            None,
        )
        .await?;

        info!(%batch_id, job_id = %job.id, "retrying batch");
        self.process_batch(batch_id).await
    }

    // =========================================================================
    // Cancellation and progress
    // =========================================================================

    /// Cancel a job that has not finished
    ///
    /// Batches not yet started are cancelled; a batch in flight stops before
    /// its next contact. Contacts already enrolled stay enrolled.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: Uuid) -> Result<BulkEnrollmentJob, EngineError> {
        let cancelled = self
            .store
            .transition_job(
                job_id,
                &BulkJobStatus::CANCELLABLE,
                BulkJobStatus::Cancelled,
                None,
                Utc::now(),
            )
            .await?;
        if cancelled.is_none() {
            let job = self.store.get_job(job_id).await?;
            return Err(EngineError::JobNotCancellable {
                job_id,
                status: job.status,
            });
        }

        for batch in self.store.list_batches(job_id).await? {
            if batch.status == BatchStatus::Pending {
                self.store
                    .transition_batch(batch.id, &[BatchStatus::Pending], BatchStatus::Cancelled)
                    .await?;
            }
        }
        info!(%job_id, "bulk job cancelled");
        self.reconcile(job_id).await
    }

    /// Recompute job counters from its finished batches and close the job
    /// once every batch is finished
    pub async fn reconcile(&self, job_id: Uuid) -> Result<BulkEnrollmentJob, EngineError> {
        let job = self.store.get_job(job_id).await?;
        let batches = self.store.list_batches(job_id).await?;
        let counters = recompute(&batches);
        self.store.update_job_counters(job_id, &counters).await?;

        let all_finished = !batches.is_empty() && batches.iter().all(|b| b.status.is_terminal());
        if job.status == BulkJobStatus::Processing && all_finished {
            let (to, message) = if counters.failed_batches > 0 {
                (
                    BulkJobStatus::Failed,
                    Some(format!("{} of {} batches failed", counters.failed_batches, counters.total_batches)),
                )
            } else {
                (BulkJobStatus::Completed, None)
            };
            if self
                .transition(job_id, &[BulkJobStatus::Processing], to, message)
                .await?
            {
                info!(
                    %job_id,
                    status = %to,
                    enrolled = counters.success_count,
                    failed = counters.failure_count,
                    skipped = counters.skipped_count,
                    "bulk job finished"
                );
            }
        }
        Ok(self.store.get_job(job_id).await?)
    }

    pub async fn progress(&self, job_id: Uuid) -> Result<JobProgress, EngineError> {
        let job = self.store.get_job(job_id).await?;
        Ok(JobProgress::from_job(&job))
    }

    pub async fn failures(&self, job_id: Uuid) -> Result<Vec<BulkEnrollmentFailure>, EngineError> {
        Ok(self.store.list_failures(job_id).await?)
    }

    pub async fn batches(&self, job_id: Uuid) -> Result<Vec<BulkEnrollmentBatch>, EngineError> {
        Ok(self.store.list_batches(job_id).await?)
    }

    async fn transition(
        &self,
        job_id: Uuid,
        from: &[BulkJobStatus],
        to: BulkJobStatus,
        error_message: Option<String>,
    ) -> Result<bool, EngineError> {
        let moved = self
            .store
            .transition_job(job_id, from, to, error_message, Utc::now())
            .await?;
        Ok(moved.is_some())
    }
}

/// Counters over the job's batches; contact outcomes come from finished
/// batches only
fn recompute(batches: &[BulkEnrollmentBatch]) -> JobCounters {
    let mut counters = JobCounters {
        total_batches: batches.len(),
        ..JobCounters::default()
    };
    for batch in batches {
        counters.total_contacts += batch.contact_ids.len();
        match batch.status {
            BatchStatus::Completed => counters.completed_batches += 1,
            BatchStatus::Failed => counters.failed_batches += 1,
            _ => {}
        }
        if batch.status.is_terminal() {
            counters.success_count += batch.success_ids.len();
            counters.failure_count += batch.failure_ids.len();
            counters.skipped_count += batch.skipped_ids.len();
        }
    }
    counters.processed_count = counters.success_count + counters.failure_count + counters.skipped_count;
    counters
}

fn batch_metadata(options: &Value, job_id: Uuid) -> Value {
    let mut metadata = match options {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    metadata.insert("bulk_job_id".to_string(), json!(job_id));
    Value::Object(metadata)
}
