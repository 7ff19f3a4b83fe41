//! Bulk enrollment jobs, batches and per-contact failures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::criteria::FieldCriterion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkJobStatus {
    Pending,
    Validating,
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

string_enum!(BulkJobStatus {
    Pending => "pending",
    Validating => "validating",
    Queued => "queued",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl BulkJobStatus {
    pub const CANCELLABLE: [BulkJobStatus; 4] = [
        BulkJobStatus::Pending,
        BulkJobStatus::Validating,
        BulkJobStatus::Queued,
        BulkJobStatus::Processing,
    ];

    pub fn is_cancellable(&self) -> bool {
        Self::CANCELLABLE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BulkJobStatus::Completed | BulkJobStatus::Failed | BulkJobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

string_enum!(BatchStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

/// Which contacts a bulk job enrolls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContactSelection {
    Manual { contact_ids: Vec<Uuid> },
    Filter { criteria: Vec<FieldCriterion> },
    /// CSV upload resolved by the contact store
    Csv {
        content: String,
        #[serde(default = "default_csv_column")]
        column: String,
    },
}

fn default_csv_column() -> String {
    "email".to_string()
}

/// Options supplied when a job is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkEnrollmentOptions {
    pub batch_size: usize,
    /// Route already-enrolled contacts to `skipped` instead of failures
    #[serde(default)]
    pub skip_duplicates: bool,
    /// Metadata copied onto every created execution
    #[serde(default)]
    pub metadata: Value,
}

impl Default for BulkEnrollmentOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            skip_duplicates: false,
            metadata: Value::Null,
        }
    }
}

impl BulkEnrollmentOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn skip_duplicates(mut self) -> Self {
        self.skip_duplicates = true;
        self
    }
}

/// Job counters derived from the job's batches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub total_contacts: usize,
    pub processed_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub skipped_count: usize,
    pub total_batches: usize,
    pub completed_batches: usize,
    pub failed_batches: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkEnrollmentJob {
    pub id: Uuid,
    pub account_id: Uuid,
    pub workflow_id: Uuid,
    pub selection: ContactSelection,
    pub options: BulkEnrollmentOptions,
    pub status: BulkJobStatus,
    pub batch_size: usize,
    pub counters: JobCounters,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BulkEnrollmentJob {
    pub fn new(
        account_id: Uuid,
        workflow_id: Uuid,
        selection: ContactSelection,
        options: BulkEnrollmentOptions,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            account_id,
            workflow_id,
            batch_size: options.batch_size,
            selection,
            options,
            status: BulkJobStatus::Pending,
            counters: JobCounters::default(),
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkEnrollmentBatch {
    pub id: Uuid,
    pub job_id: Uuid,
    /// 1-based position within the job
    pub batch_number: u32,
    pub contact_ids: Vec<Uuid>,
    pub status: BatchStatus,
    pub success_ids: Vec<Uuid>,
    pub failure_ids: Vec<Uuid>,
    pub skipped_ids: Vec<Uuid>,
    pub attempt_count: u32,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BulkEnrollmentBatch {
    pub fn new(job_id: Uuid, batch_number: u32, contact_ids: Vec<Uuid>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            batch_number,
            contact_ids,
            status: BatchStatus::Pending,
            success_ids: Vec::new(),
            failure_ids: Vec::new(),
            skipped_ids: Vec::new(),
            attempt_count: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Contact already has an outcome from an earlier attempt
    pub fn is_processed(&self, contact_id: &Uuid) -> bool {
        self.success_ids.contains(contact_id)
            || self.failure_ids.contains(contact_id)
            || self.skipped_ids.contains(contact_id)
    }

    pub fn processed_count(&self) -> usize {
        self.success_ids.len() + self.failure_ids.len() + self.skipped_ids.len()
    }
}

/// One contact that could not be enrolled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkEnrollmentFailure {
    pub id: Uuid,
    pub job_id: Uuid,
    pub batch_id: Uuid,
    pub contact_id: Uuid,
    pub error_code: String,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

impl BulkEnrollmentFailure {
    pub fn new(
        batch: &BulkEnrollmentBatch,
        contact_id: Uuid,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id: batch.job_id,
            batch_id: batch.id,
            contact_id,
            error_code: error_code.into(),
            error_message: error_message.into(),
            created_at: Utc::now(),
        }
    }
}

/// Progress snapshot returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: Uuid,
    pub status: BulkJobStatus,
    pub counters: JobCounters,
    pub percent_complete: f64,
    pub error_message: Option<String>,
}

impl JobProgress {
    pub fn from_job(job: &BulkEnrollmentJob) -> Self {
        let percent_complete = if job.counters.total_contacts == 0 {
            if job.status == BulkJobStatus::Completed {
                100.0
            } else {
                0.0
            }
        } else {
            (job.counters.processed_count as f64 / job.counters.total_contacts as f64 * 100.0)
                .min(100.0)
        };

        Self {
            job_id: job.id,
            status: job.status,
            counters: job.counters,
            percent_complete,
            error_message: job.error_message.clone(),
        }
    }
}
