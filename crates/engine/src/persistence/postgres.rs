//! PostgreSQL implementation of the engine repositories
//!
//! Conditional updates are single `UPDATE ... WHERE status = ANY(..)`
//! statements or short transactions holding a row lock. "One open row" rules
//! are partial unique indexes (see `migrations/0001_engine.sql`), and
//! per-account or per-workflow checks take a transaction-scoped advisory lock.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::model::{
    ActionExecution, BatchStatus, BulkEnrollmentBatch, BulkEnrollmentFailure, BulkEnrollmentJob,
    BulkJobStatus, ConditionLog, EventListener, ExecutionStatus, ExitReason, GoalAchievement,
    JobCounters, ListenerStatus, MigrationErrorEntry, MigrationStatus, VersionMigration,
    WaitExecution, WorkflowExecution, WorkflowVersion,
};

/// PostgreSQL engine store
///
/// ```ignore
/// let pool = PgPool::connect(&database_url).await?;
/// let store = Arc::new(PostgresEngineStore::new(pool));
/// ```
#[derive(Clone)]
pub struct PostgresEngineStore {
    pool: PgPool,
}

impl PostgresEngineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn db_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| {
        error!(operation, error = %e, "database operation failed");
        StoreError::Database(e.to_string())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error().is_some_and(|db| db.is_unique_violation())
}

fn parse<T: FromStr<Err = String>>(value: &str) -> Result<T, StoreError> {
    value.parse().map_err(StoreError::Serialization)
}

fn parse_opt<T: FromStr<Err = String>>(value: Option<String>) -> Result<Option<T>, StoreError> {
    value.as_deref().map(parse).transpose()
}

fn from_json<T: DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    Ok(serde_json::from_value(value)?)
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(value)?)
}

fn status_texts<T: ToString>(statuses: &[T]) -> Vec<String> {
    statuses.iter().map(ToString::to_string).collect()
}

fn expires_at(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(300))
}

/// Serialize `account_id`- or `workflow_id`-scoped checks
async fn advisory_lock<'e>(executor: impl PgExecutor<'e>, key: Uuid) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
        .bind(key)
        .execute(executor)
        .await
        .map_err(db_error("advisory lock"))?;
    Ok(())
}

const OPEN_EXECUTION: &str = "status IN ('queued', 'active', 'waiting')";

const EXECUTION_COLUMNS: &str = "id, workflow_id, workflow_version, account_id, contact_id, status, \
     current_node_id, current_step_index, enrollment_source, next_run_at, retry_count, \
     error_message, exit_reason, metadata, created_at, updated_at, started_at, completed_at";

fn execution_from_row(row: &PgRow) -> Result<WorkflowExecution, StoreError> {
    Ok(WorkflowExecution {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        workflow_version: row.get::<i32, _>("workflow_version") as u32,
        account_id: row.get("account_id"),
        contact_id: row.get("contact_id"),
        status: parse(row.get("status"))?,
        current_node_id: row.get("current_node_id"),
        current_step_index: row.get::<i32, _>("current_step_index") as u32,
        enrollment_source: parse(row.get("enrollment_source"))?,
        next_run_at: row.get("next_run_at"),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        error_message: row.get("error_message"),
        exit_reason: parse_opt::<ExitReason>(row.get("exit_reason"))?,
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

async fn write_execution<'e>(executor: impl PgExecutor<'e>, execution: &WorkflowExecution) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE workflow_executions
        SET workflow_version = $2, status = $3, current_node_id = $4, current_step_index = $5,
            next_run_at = $6, retry_count = $7, error_message = $8, exit_reason = $9,
            metadata = $10, updated_at = $11, started_at = $12, completed_at = $13
        WHERE id = $1
        "#,
    )
    .bind(execution.id)
    .bind(execution.workflow_version as i32)
    .bind(execution.status.as_str())
    .bind(&execution.current_node_id)
    .bind(execution.current_step_index as i32)
    .bind(execution.next_run_at)
    .bind(execution.retry_count as i32)
    .bind(&execution.error_message)
    .bind(execution.exit_reason.map(|r| r.as_str()))
    .bind(&execution.metadata)
    .bind(execution.updated_at)
    .bind(execution.started_at)
    .bind(execution.completed_at)
    .execute(executor)
    .await
    .map_err(db_error("write execution"))?;
    Ok(())
}

fn lease_from_row(row: &PgRow) -> Lease {
    Lease {
        execution_id: row.get("id"),
        token: row.get("lease_token"),
        owner: row.get("lease_owner"),
        acquired_at: row.get("lease_acquired_at"),
        expires_at: row.get("lease_expires_at"),
    }
}

const ACTION_COLUMNS: &str = "id, workflow_execution_id, node_id, action_type, status, execution_data, \
     result_data, error_message, retry_count, created_at, scheduled_at, started_at, completed_at";

fn action_from_row(row: &PgRow) -> Result<ActionExecution, StoreError> {
    Ok(ActionExecution {
        id: row.get("id"),
        workflow_execution_id: row.get("workflow_execution_id"),
        node_id: row.get("node_id"),
        action_type: row.get("action_type"),
        status: parse(row.get("status"))?,
        execution_data: row.get("execution_data"),
        result_data: row.get("result_data"),
        error_message: row.get("error_message"),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        created_at: row.get("created_at"),
        scheduled_at: row.get("scheduled_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

const WAIT_COLUMNS: &str = "id, workflow_execution_id, step_id, account_id, contact_id, wait_type, status, \
     scheduled_at, event_type, event_correlation_id, event_timeout_at, pending_resume, resumed_at, \
     resumed_by, resume_event, error_message, created_at";

fn wait_from_row(row: &PgRow) -> Result<WaitExecution, StoreError> {
    Ok(WaitExecution {
        id: row.get("id"),
        workflow_execution_id: row.get("workflow_execution_id"),
        step_id: row.get("step_id"),
        account_id: row.get("account_id"),
        contact_id: row.get("contact_id"),
        wait_type: parse(row.get("wait_type"))?,
        status: parse(row.get("status"))?,
        scheduled_at: row.get("scheduled_at"),
        event_type: row.get("event_type"),
        event_correlation_id: row.get("event_correlation_id"),
        event_timeout_at: row.get("event_timeout_at"),
        pending_resume: parse_opt(row.get("pending_resume"))?,
        resumed_at: row.get("resumed_at"),
        resumed_by: parse_opt(row.get("resumed_by"))?,
        resume_event: row.get("resume_event"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
    })
}

const LISTENER_COLUMNS: &str = "id, wait_execution_id, workflow_execution_id, event_type, correlation_id, \
     account_id, contact_id, match_criteria, expires_at, status, matched_at, matched_event, created_at";

fn listener_from_row(row: &PgRow) -> Result<EventListener, StoreError> {
    Ok(EventListener {
        id: row.get("id"),
        wait_execution_id: row.get("wait_execution_id"),
        workflow_execution_id: row.get("workflow_execution_id"),
        event_type: row.get("event_type"),
        correlation_id: row.get("correlation_id"),
        account_id: row.get("account_id"),
        contact_id: row.get("contact_id"),
        match_criteria: from_json(row.get("match_criteria"))?,
        expires_at: row.get("expires_at"),
        status: parse(row.get("status"))?,
        matched_at: row.get("matched_at"),
        matched_event: row.get("matched_event"),
        created_at: row.get("created_at"),
    })
}

fn achievement_from_row(row: &PgRow) -> Result<GoalAchievement, StoreError> {
    Ok(GoalAchievement {
        id: row.get("id"),
        goal_config_id: row.get("goal_config_id"),
        goal_type: parse(row.get("goal_type"))?,
        account_id: row.get("account_id"),
        contact_id: row.get("contact_id"),
        workflow_id: row.get("workflow_id"),
        workflow_execution_id: row.get("workflow_execution_id"),
        trigger_event_type: row.get("trigger_event_type"),
        event_data: row.get("event_data"),
        achieved_at: row.get("achieved_at"),
    })
}

const JOB_COLUMNS: &str = "id, account_id, workflow_id, selection, options, status, batch_size, \
     total_contacts, processed_count, success_count, failure_count, skipped_count, total_batches, \
     completed_batches, failed_batches, error_message, created_at, started_at, completed_at";

fn job_from_row(row: &PgRow) -> Result<BulkEnrollmentJob, StoreError> {
    let count = |name: &str| row.get::<i32, _>(name) as usize;
    Ok(BulkEnrollmentJob {
        id: row.get("id"),
        account_id: row.get("account_id"),
        workflow_id: row.get("workflow_id"),
        selection: from_json(row.get("selection"))?,
        options: from_json(row.get("options"))?,
        status: parse(row.get("status"))?,
        batch_size: count("batch_size"),
        counters: JobCounters {
            total_contacts: count("total_contacts"),
            processed_count: count("processed_count"),
            success_count: count("success_count"),
            failure_count: count("failure_count"),
            skipped_count: count("skipped_count"),
            total_batches: count("total_batches"),
            completed_batches: count("completed_batches"),
            failed_batches: count("failed_batches"),
        },
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

const BATCH_COLUMNS: &str = "id, job_id, batch_number, contact_ids, status, success_ids, failure_ids, \
     skipped_ids, attempt_count, error_message, started_at, completed_at";

fn batch_from_row(row: &PgRow) -> Result<BulkEnrollmentBatch, StoreError> {
    Ok(BulkEnrollmentBatch {
        id: row.get("id"),
        job_id: row.get("job_id"),
        batch_number: row.get::<i32, _>("batch_number") as u32,
        contact_ids: row.get("contact_ids"),
        status: parse(row.get("status"))?,
        success_ids: row.get("success_ids"),
        failure_ids: row.get("failure_ids"),
        skipped_ids: row.get("skipped_ids"),
        attempt_count: row.get::<i32, _>("attempt_count") as u32,
        error_message: row.get("error_message"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

const VERSION_COLUMNS: &str = "id, workflow_id, account_id, version_number, status, is_current, definition, \
     active_executions, change_summary, created_at, published_at";

fn version_from_row(row: &PgRow) -> Result<WorkflowVersion, StoreError> {
    Ok(WorkflowVersion {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        account_id: row.get("account_id"),
        version_number: row.get::<i32, _>("version_number") as u32,
        status: parse(row.get("status"))?,
        is_current: row.get("is_current"),
        definition: from_json(row.get("definition"))?,
        active_executions: row.get("active_executions"),
        change_summary: row.get("change_summary"),
        created_at: row.get("created_at"),
        published_at: row.get("published_at"),
    })
}

const MIGRATION_COLUMNS: &str = "id, workflow_id, source_version_id, target_version_id, source_version, \
     target_version, strategy, mapping_rules, batch_size, status, total_contacts, contacts_migrated, \
     contacts_failed, error_log, cursor_id, error_message, created_at, started_at, completed_at";

fn migration_from_row(row: &PgRow) -> Result<VersionMigration, StoreError> {
    Ok(VersionMigration {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        source_version_id: row.get("source_version_id"),
        target_version_id: row.get("target_version_id"),
        source_version: row.get::<i32, _>("source_version") as u32,
        target_version: row.get::<i32, _>("target_version") as u32,
        strategy: parse(row.get("strategy"))?,
        mapping_rules: from_json(row.get("mapping_rules"))?,
        batch_size: row.get::<i32, _>("batch_size") as usize,
        status: parse(row.get("status"))?,
        total_contacts: row.get::<i32, _>("total_contacts") as usize,
        contacts_migrated: row.get::<i32, _>("contacts_migrated") as usize,
        contacts_failed: row.get::<i32, _>("contacts_failed") as usize,
        error_log: from_json(row.get("error_log"))?,
        cursor: row.get("cursor_id"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

async fn insert_migration<'e>(executor: impl PgExecutor<'e>, migration: &VersionMigration) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO version_migrations (
            id, workflow_id, source_version_id, target_version_id, source_version, target_version,
            strategy, mapping_rules, batch_size, status, total_contacts, contacts_migrated,
            contacts_failed, error_log, cursor_id, error_message, created_at, started_at, completed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#,
    )
    .bind(migration.id)
    .bind(migration.workflow_id)
    .bind(migration.source_version_id)
    .bind(migration.target_version_id)
    .bind(migration.source_version as i32)
    .bind(migration.target_version as i32)
    .bind(migration.strategy.as_str())
    .bind(to_json(&migration.mapping_rules)?)
    .bind(migration.batch_size as i32)
    .bind(migration.status.as_str())
    .bind(migration.total_contacts as i32)
    .bind(migration.contacts_migrated as i32)
    .bind(migration.contacts_failed as i32)
    .bind(to_json(&migration.error_log)?)
    .bind(migration.cursor)
    .bind(&migration.error_message)
    .bind(migration.created_at)
    .bind(migration.started_at)
    .bind(migration.completed_at)
    .execute(executor)
    .await
    .map_err(db_error("insert migration"))?;
    Ok(())
}

async fn active_migration_id<'e>(executor: impl PgExecutor<'e>, workflow_id: Uuid) -> Result<Option<Uuid>, StoreError> {
    let row = sqlx::query(
        "SELECT id FROM version_migrations WHERE workflow_id = $1 AND status IN ('pending', 'running')",
    )
    .bind(workflow_id)
    .fetch_optional(executor)
    .await
    .map_err(db_error("find active migration"))?;
    Ok(row.map(|r| r.get("id")))
}

/// Lock an execution row and check that `execution` may be written over it
async fn lock_for_save(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    lease: &Lease,
    execution: &WorkflowExecution,
) -> Result<(), StoreError> {
    let row = sqlx::query("SELECT status, lease_token FROM workflow_executions WHERE id = $1 FOR UPDATE")
        .bind(execution.id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_error("lock execution"))?
        .ok_or(StoreError::ExecutionNotFound(execution.id))?;

    if row.get::<Option<Uuid>, _>("lease_token") != Some(lease.token) {
        return Err(StoreError::LeaseLost {
            execution_id: execution.id,
        });
    }
    let current: ExecutionStatus = parse(row.get("status"))?;
    if current.is_terminal() {
        return Err(StoreError::TerminalState {
            execution_id: execution.id,
            status: current,
        });
    }
    if !current.can_transition_to(execution.status) {
        return Err(StoreError::InvalidTransition {
            execution_id: execution.id,
            from: current,
            to: execution.status,
        });
    }
    Ok(())
}

async fn insert_achievement<'e>(
    executor: impl PgExecutor<'e>,
    achievement: &GoalAchievement,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO goal_achievements (
            id, goal_config_id, goal_type, account_id, contact_id, workflow_id,
            workflow_execution_id, trigger_event_type, event_data, achieved_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (contact_id, goal_config_id) DO NOTHING
        "#,
    )
    .bind(achievement.id)
    .bind(achievement.goal_config_id)
    .bind(achievement.goal_type.as_str())
    .bind(achievement.account_id)
    .bind(achievement.contact_id)
    .bind(achievement.workflow_id)
    .bind(achievement.workflow_execution_id)
    .bind(&achievement.trigger_event_type)
    .bind(&achievement.event_data)
    .bind(achievement.achieved_at)
    .execute(executor)
    .await
    .map_err(db_error("record achievement"))?;
    Ok(result.rows_affected() == 1)
}

/// `active → to` on a listener; `false` if it had already left `active`
async fn update_listener<'e>(
    executor: impl PgExecutor<'e>,
    id: Uuid,
    to: ListenerStatus,
    event: Option<Value>,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    if to == ListenerStatus::Active {
        return Ok(false);
    }
    let matched = to == ListenerStatus::Matched;

    let result = sqlx::query(
        r#"
        UPDATE event_listeners
        SET status = $2,
            matched_at = COALESCE($3, matched_at),
            matched_event = COALESCE($4, matched_event)
        WHERE id = $1 AND status = 'active'
        "#,
    )
    .bind(id)
    .bind(to.as_str())
    .bind(matched.then_some(now))
    .bind(if matched { event } else { None })
    .execute(executor)
    .await
    .map_err(db_error("close listener"))?;
    Ok(result.rows_affected() == 1)
}

async fn update_wait<'e>(
    executor: impl PgExecutor<'e>,
    transition: &WaitTransition<'_>,
) -> Result<Option<WaitExecution>, StoreError> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE wait_executions
        SET status = $2,
            scheduled_at = COALESCE($3, scheduled_at),
            pending_resume = COALESCE($4, pending_resume),
            resume_event = COALESCE($5, resume_event),
            error_message = COALESCE($6, error_message),
            resumed_by = COALESCE($7, resumed_by),
            resumed_at = CASE WHEN $7::text IS NULL THEN resumed_at ELSE $8 END
        WHERE id = $1 AND status = ANY($9)
        RETURNING {WAIT_COLUMNS}
        "#
    ))
    .bind(transition.wait_id)
    .bind(transition.to.as_str())
    .bind(transition.scheduled_at)
    .bind(transition.pending_resume.map(|r| r.as_str()))
    .bind(&transition.resume_event)
    .bind(&transition.error_message)
    .bind(transition.resumed_by.map(|r| r.as_str()))
    .bind(transition.now)
    .bind(status_texts(transition.from))
    .fetch_optional(executor)
    .await
    .map_err(db_error("transition wait"))?;
    row.as_ref().map(wait_from_row).transpose()
}

impl PostgresEngineStore {
    async fn exists(&self, table: &'static str, id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query(&format!("SELECT EXISTS (SELECT 1 FROM {table} WHERE id = $1) AS found"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("check existence"))?;
        Ok(row.get("found"))
    }

    async fn fetch_executions(&self, sql: &str, binds: ExecutionQuery) -> Result<Vec<WorkflowExecution>, StoreError> {
        let query = sqlx::query(sql);
        let query = match binds {
            ExecutionQuery::WorkflowContact(workflow_id, contact_id) => query.bind(workflow_id).bind(contact_id),
            ExecutionQuery::AccountContact(account_id, contact_id) => query.bind(account_id).bind(contact_id),
            ExecutionQuery::InFlight {
                workflow_id,
                version,
                after,
                limit,
            } => query
                .bind(workflow_id)
                .bind(version as i32)
                .bind(after)
                .bind(limit as i64),
        };
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list executions"))?;
        rows.iter().map(execution_from_row).collect()
    }
}

enum ExecutionQuery {
    WorkflowContact(Uuid, Uuid),
    AccountContact(Uuid, Uuid),
    InFlight {
        workflow_id: Uuid,
        version: u32,
        after: Option<Uuid>,
        limit: usize,
    },
}

// =============================================================================
// Executions
// =============================================================================

#[async_trait]
impl ExecutionRepository for PostgresEngineStore {
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_executions (
                id, workflow_id, workflow_version, account_id, contact_id, status, current_node_id,
                current_step_index, enrollment_source, next_run_at, retry_count, error_message,
                exit_reason, metadata, created_at, updated_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(execution.id)
        .bind(execution.workflow_id)
        .bind(execution.workflow_version as i32)
        .bind(execution.account_id)
        .bind(execution.contact_id)
        .bind(execution.status.as_str())
        .bind(&execution.current_node_id)
        .bind(execution.current_step_index as i32)
        .bind(execution.enrollment_source.as_str())
        .bind(execution.next_run_at)
        .bind(execution.retry_count as i32)
        .bind(&execution.error_message)
        .bind(execution.exit_reason.map(|r| r.as_str()))
        .bind(&execution.metadata)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(format!(
                    "contact {} already has an open execution of workflow {}",
                    execution.contact_id, execution.workflow_id
                ))
            } else {
                db_error("insert execution")(e)
            }
        })?;

        debug!(workflow_id = %execution.workflow_id, "inserted execution");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError> {
        let row = sqlx::query(&format!("SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get execution"))?
            .ok_or(StoreError::ExecutionNotFound(id))?;
        execution_from_row(&row)
    }

    async fn find_executions_for_contact(
        &self,
        workflow_id: Uuid,
        contact_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
             WHERE workflow_id = $1 AND contact_id = $2 ORDER BY id"
        );
        self.fetch_executions(&sql, ExecutionQuery::WorkflowContact(workflow_id, contact_id))
            .await
    }

    async fn list_open_executions_for_contact(
        &self,
        account_id: Uuid,
        contact_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
             WHERE account_id = $1 AND contact_id = $2 AND {OPEN_EXECUTION} ORDER BY id"
        );
        self.fetch_executions(&sql, ExecutionQuery::AccountContact(account_id, contact_id))
            .await
    }

    async fn list_in_flight(
        &self,
        workflow_id: Uuid,
        version: u32,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
             WHERE workflow_id = $1 AND workflow_version = $2 AND {OPEN_EXECUTION} \
               AND ($3::uuid IS NULL OR id > $3) \
             ORDER BY id LIMIT $4"
        );
        self.fetch_executions(
            &sql,
            ExecutionQuery::InFlight {
                workflow_id,
                version,
                after,
                limit,
            },
        )
        .await
    }

    async fn count_in_flight(&self, workflow_id: Uuid, version: u32) -> Result<usize, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM workflow_executions \
             WHERE workflow_id = $1 AND workflow_version = $2 AND {OPEN_EXECUTION}"
        ))
        .bind(workflow_id)
        .bind(version as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("count in-flight executions"))?;
        Ok(row.get::<i64, _>("n") as usize)
    }

    async fn count_running(&self, account_id: Uuid) -> Result<usize, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM workflow_executions \
             WHERE account_id = $1 AND status IN ('active', 'waiting')",
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("count running executions"))?;
        Ok(row.get::<i64, _>("n") as usize)
    }

    async fn list_runnable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM workflow_executions
            WHERE status IN ('queued', 'active')
              AND next_run_at <= $1
              AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
            ORDER BY next_run_at, id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list runnable executions"))?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self, request), fields(execution_id = %request.execution_id, owner = request.owner))]
    async fn acquire_lease(&self, request: LeaseRequest<'_>) -> Result<LeaseOutcome, StoreError> {
        let now = request.now;
        let mut tx = self.pool.begin().await.map_err(db_error("begin acquire lease"))?;

        let row = sqlx::query(
            r#"
            SELECT account_id, status, lease_owner, lease_expires_at
            FROM workflow_executions WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(request.execution_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("lock execution"))?
        .ok_or(StoreError::ExecutionNotFound(request.execution_id))?;

        let status: ExecutionStatus = parse(row.get("status"))?;
        if status.is_terminal() {
            return Ok(LeaseOutcome::Terminal(status));
        }
        let held_until: Option<DateTime<Utc>> = row.get("lease_expires_at");
        if let Some(expires_at) = held_until.filter(|at| *at > now) {
            return Ok(LeaseOutcome::Held {
                owner: row.get::<Option<String>, _>("lease_owner").unwrap_or_default(),
                expires_at,
            });
        }

        if let (ExecutionStatus::Queued, Some(limit)) = (status, request.start_limit) {
            let account_id: Uuid = row.get("account_id");
            advisory_lock(&mut *tx, account_id).await?;
            let counted = sqlx::query(
                r#"
                SELECT COUNT(*) AS n FROM workflow_executions
                WHERE account_id = $1 AND id <> $2
                  AND (status IN ('active', 'waiting')
                       OR (status = 'queued' AND lease_expires_at > $3))
                "#,
            )
            .bind(account_id)
            .bind(request.execution_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("count running executions"))?;
            let running = counted.get::<i64, _>("n") as usize;
            if running >= limit {
                return Ok(LeaseOutcome::LimitReached { running });
            }
        }

        let leased = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET lease_token = $2, lease_owner = $3, lease_acquired_at = $4, lease_expires_at = $5
            WHERE id = $1
            RETURNING id, lease_token, lease_owner, lease_acquired_at, lease_expires_at
            "#,
        )
        .bind(request.execution_id)
        .bind(Uuid::now_v7())
        .bind(request.owner)
        .bind(now)
        .bind(expires_at(now, request.ttl))
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("acquire lease"))?;

        tx.commit().await.map_err(db_error("commit acquire lease"))?;
        Ok(LeaseOutcome::Acquired(lease_from_row(&leased)))
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> Result<Lease, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_executions SET lease_expires_at = $3
            WHERE id = $1 AND lease_token = $2
            RETURNING id, lease_token, lease_owner, lease_acquired_at, lease_expires_at
            "#,
        )
        .bind(lease.execution_id)
        .bind(lease.token)
        .bind(expires_at(now, ttl))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("renew lease"))?
        .ok_or(StoreError::LeaseLost {
            execution_id: lease.execution_id,
        })?;
        Ok(lease_from_row(&row))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET lease_token = NULL, lease_owner = NULL, lease_acquired_at = NULL, lease_expires_at = NULL
            WHERE id = $1 AND lease_token = $2
            "#,
        )
        .bind(lease.execution_id)
        .bind(lease.token)
        .execute(&self.pool)
        .await
        .map_err(db_error("release lease"))?;
        Ok(())
    }

    #[instrument(skip(self, lease, execution), fields(execution_id = %execution.id, status = %execution.status))]
    async fn save_execution(&self, lease: &Lease, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin save execution"))?;
        lock_for_save(&mut tx, lease, execution).await?;
        write_execution(&mut *tx, execution).await?;
        tx.commit().await.map_err(db_error("commit save execution"))?;
        Ok(())
    }

    #[instrument(skip(self, from, error_message))]
    async fn transition_execution(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin transition execution"))?;

        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("lock execution"))?
        .ok_or(StoreError::ExecutionNotFound(id))?;

        let mut execution = execution_from_row(&row)?;
        if !from.contains(&execution.status) || execution.transition(to, now).is_err() {
            return Ok(None);
        }
        if let Some(reason) = ExitReason::for_status(to) {
            execution.exit_reason = Some(reason);
        }
        if error_message.is_some() {
            execution.error_message = error_message;
        }

        write_execution(&mut *tx, &execution).await?;
        tx.commit().await.map_err(db_error("commit transition execution"))?;
        Ok(Some(execution))
    }

    // =========================================================================
    // Action executions
    // =========================================================================

    async fn insert_action_execution(&self, action: &ActionExecution) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO action_executions (
                id, workflow_execution_id, node_id, action_type, status, execution_data, result_data,
                error_message, retry_count, created_at, scheduled_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(action.id)
        .bind(action.workflow_execution_id)
        .bind(&action.node_id)
        .bind(&action.action_type)
        .bind(action.status.as_str())
        .bind(&action.execution_data)
        .bind(&action.result_data)
        .bind(&action.error_message)
        .bind(action.retry_count as i32)
        .bind(action.created_at)
        .bind(action.scheduled_at)
        .bind(action.started_at)
        .bind(action.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(format!(
                    "execution {} already has an open action execution",
                    action.workflow_execution_id
                ))
            } else {
                db_error("insert action execution")(e)
            }
        })?;
        Ok(())
    }

    async fn update_action_execution(&self, action: &ActionExecution) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE action_executions
            SET status = $2, execution_data = $3, result_data = $4, error_message = $5,
                retry_count = $6, scheduled_at = $7, started_at = $8, completed_at = $9
            WHERE id = $1
            "#,
        )
        .bind(action.id)
        .bind(action.status.as_str())
        .bind(&action.execution_data)
        .bind(&action.result_data)
        .bind(&action.error_message)
        .bind(action.retry_count as i32)
        .bind(action.scheduled_at)
        .bind(action.started_at)
        .bind(action.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("update action execution"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ActionExecutionNotFound(action.id));
        }
        Ok(())
    }

    async fn open_action_execution(&self, execution_id: Uuid) -> Result<Option<ActionExecution>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACTION_COLUMNS} FROM action_executions \
             WHERE workflow_execution_id = $1 AND status NOT IN ('completed', 'failed', 'skipped')"
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get open action execution"))?;
        row.as_ref().map(action_from_row).transpose()
    }

    async fn list_action_executions(&self, execution_id: Uuid) -> Result<Vec<ActionExecution>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ACTION_COLUMNS} FROM action_executions WHERE workflow_execution_id = $1 ORDER BY id"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list action executions"))?;
        rows.iter().map(action_from_row).collect()
    }

    async fn insert_condition_log(&self, log: &ConditionLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO condition_logs (
                id, workflow_execution_id, node_id, condition_type, branch_id, matched, details,
                duration_micros, evaluated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(log.id)
        .bind(log.workflow_execution_id)
        .bind(&log.node_id)
        .bind(&log.condition_type)
        .bind(&log.branch_id)
        .bind(log.matched)
        .bind(&log.details)
        .bind(log.duration_micros as i64)
        .bind(log.evaluated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("insert condition log"))?;
        Ok(())
    }

    async fn list_condition_logs(&self, execution_id: Uuid) -> Result<Vec<ConditionLog>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_execution_id, node_id, condition_type, branch_id, matched, details,
                   duration_micros, evaluated_at
            FROM condition_logs WHERE workflow_execution_id = $1
            ORDER BY evaluated_at, id
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list condition logs"))?;

        Ok(rows
            .iter()
            .map(|row| ConditionLog {
                id: row.get("id"),
                workflow_execution_id: row.get("workflow_execution_id"),
                node_id: row.get("node_id"),
                condition_type: row.get("condition_type"),
                branch_id: row.get("branch_id"),
                matched: row.get("matched"),
                details: row.get("details"),
                duration_micros: row.get::<i64, _>("duration_micros") as u64,
                evaluated_at: row.get("evaluated_at"),
            })
            .collect())
    }
}

// =============================================================================
// Waits
// =============================================================================

#[async_trait]
impl WaitRepository for PostgresEngineStore {
    #[instrument(skip(self, wait), fields(execution_id = %wait.workflow_execution_id, step_id = %wait.step_id))]
    async fn insert_wait(&self, wait: &WaitExecution) -> Result<WaitInsert, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO wait_executions (
                id, workflow_execution_id, step_id, account_id, contact_id, wait_type, status,
                scheduled_at, event_type, event_correlation_id, event_timeout_at, pending_resume,
                resumed_at, resumed_by, resume_event, error_message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (workflow_execution_id, step_id) DO NOTHING
            "#,
        )
        .bind(wait.id)
        .bind(wait.workflow_execution_id)
        .bind(&wait.step_id)
        .bind(wait.account_id)
        .bind(wait.contact_id)
        .bind(wait.wait_type.as_str())
        .bind(wait.status.as_str())
        .bind(wait.scheduled_at)
        .bind(&wait.event_type)
        .bind(&wait.event_correlation_id)
        .bind(wait.event_timeout_at)
        .bind(wait.pending_resume.map(|r| r.as_str()))
        .bind(wait.resumed_at)
        .bind(wait.resumed_by.map(|r| r.as_str()))
        .bind(&wait.resume_event)
        .bind(&wait.error_message)
        .bind(wait.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("insert wait"))?;

        if result.rows_affected() == 1 {
            return Ok(WaitInsert::Inserted);
        }

        let row = sqlx::query(&format!(
            "SELECT {WAIT_COLUMNS} FROM wait_executions WHERE workflow_execution_id = $1 AND step_id = $2"
        ))
        .bind(wait.workflow_execution_id)
        .bind(&wait.step_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("get existing wait"))?;
        Ok(WaitInsert::Existing(wait_from_row(&row)?))
    }

    async fn get_wait(&self, id: Uuid) -> Result<WaitExecution, StoreError> {
        let row = sqlx::query(&format!("SELECT {WAIT_COLUMNS} FROM wait_executions WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get wait"))?
            .ok_or(StoreError::WaitNotFound(id))?;
        wait_from_row(&row)
    }

    async fn open_wait_for_execution(&self, execution_id: Uuid) -> Result<Option<WaitExecution>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {WAIT_COLUMNS} FROM wait_executions \
             WHERE workflow_execution_id = $1 AND status IN ('waiting', 'scheduled')"
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get open wait"))?;
        row.as_ref().map(wait_from_row).transpose()
    }

    async fn list_due_waits(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WaitExecution>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {WAIT_COLUMNS} FROM wait_executions \
             WHERE status = 'scheduled' AND scheduled_at <= $1 \
             ORDER BY scheduled_at, id LIMIT $2"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list due waits"))?;
        rows.iter().map(wait_from_row).collect()
    }

    #[instrument(skip(self, transition), fields(wait_id = %transition.wait_id, to = %transition.to))]
    async fn transition_wait(&self, transition: WaitTransition<'_>) -> Result<Option<WaitExecution>, StoreError> {
        match update_wait(&self.pool, &transition).await? {
            Some(wait) => Ok(Some(wait)),
            None if self.exists("wait_executions", transition.wait_id).await? => Ok(None),
            None => Err(StoreError::WaitNotFound(transition.wait_id)),
        }
    }
}

// =============================================================================
// Event listeners
// =============================================================================

#[async_trait]
impl EventListenerRepository for PostgresEngineStore {
    async fn insert_listener(&self, listener: &EventListener) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO event_listeners (
                id, wait_execution_id, workflow_execution_id, event_type, correlation_id, account_id,
                contact_id, match_criteria, expires_at, status, matched_at, matched_event, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(listener.id)
        .bind(listener.wait_execution_id)
        .bind(listener.workflow_execution_id)
        .bind(&listener.event_type)
        .bind(&listener.correlation_id)
        .bind(listener.account_id)
        .bind(listener.contact_id)
        .bind(to_json(&listener.match_criteria)?)
        .bind(listener.expires_at)
        .bind(listener.status.as_str())
        .bind(listener.matched_at)
        .bind(&listener.matched_event)
        .bind(listener.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(format!(
                    "wait {} already listens for {}",
                    listener.wait_execution_id, listener.event_type
                ))
            } else {
                db_error("insert listener")(e)
            }
        })?;
        Ok(())
    }

    async fn get_listener(&self, id: Uuid) -> Result<EventListener, StoreError> {
        let row = sqlx::query(&format!("SELECT {LISTENER_COLUMNS} FROM event_listeners WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get listener"))?
            .ok_or(StoreError::ListenerNotFound(id))?;
        listener_from_row(&row)
    }

    async fn find_listener_for_wait(&self, wait_execution_id: Uuid) -> Result<Option<EventListener>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LISTENER_COLUMNS} FROM event_listeners WHERE wait_execution_id = $1 \
             ORDER BY created_at LIMIT 1"
        ))
        .bind(wait_execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("find listener for wait"))?;
        row.as_ref().map(listener_from_row).transpose()
    }

    async fn find_active_listeners(
        &self,
        event_type: &str,
        contact_id: Uuid,
    ) -> Result<Vec<EventListener>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LISTENER_COLUMNS} FROM event_listeners \
             WHERE status = 'active' AND event_type = $1 AND contact_id = $2 ORDER BY id"
        ))
        .bind(event_type)
        .bind(contact_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("find active listeners"))?;
        rows.iter().map(listener_from_row).collect()
    }

    async fn list_expired_listeners(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventListener>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LISTENER_COLUMNS} FROM event_listeners \
             WHERE status = 'active' AND expires_at <= $1 \
             ORDER BY expires_at, id LIMIT $2"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list expired listeners"))?;
        rows.iter().map(listener_from_row).collect()
    }

    async fn close_listener(
        &self,
        id: Uuid,
        to: ListenerStatus,
        event: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if update_listener(&self.pool, id, to, event, now).await? {
            return Ok(true);
        }
        if self.exists("event_listeners", id).await? {
            Ok(false)
        } else {
            Err(StoreError::ListenerNotFound(id))
        }
    }

    #[instrument(skip(self, event, transition), fields(wait_id = %transition.wait_id))]
    async fn close_listener_with_wait(
        &self,
        id: Uuid,
        to: ListenerStatus,
        event: Option<Value>,
        transition: WaitTransition<'_>,
    ) -> Result<ListenerClose, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin close listener"))?;
        if !update_listener(&mut *tx, id, to, event, transition.now).await? {
            drop(tx);
            return if self.exists("event_listeners", id).await? {
                Ok(ListenerClose::AlreadyClosed)
            } else {
                Err(StoreError::ListenerNotFound(id))
            };
        }
        let wait = update_wait(&mut *tx, &transition).await?;
        if wait.is_none() {
            let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM wait_executions WHERE id = $1) AS found")
                .bind(transition.wait_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_error("check wait"))?;
            if !row.get::<bool, _>("found") {
                // rolls back the listener close
                return Err(StoreError::WaitNotFound(transition.wait_id));
            }
        }
        tx.commit().await.map_err(db_error("commit close listener"))?;
        Ok(ListenerClose::Closed(wait))
    }
}

// =============================================================================
// Goals
// =============================================================================

#[async_trait]
impl GoalRepository for PostgresEngineStore {
    async fn has_achievement(&self, contact_id: Uuid, goal_config_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM goal_achievements WHERE contact_id = $1 AND goal_config_id = $2) AS found",
        )
        .bind(contact_id)
        .bind(goal_config_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("check achievement"))?;
        Ok(row.get("found"))
    }

    #[instrument(skip(self, achievement), fields(contact_id = %achievement.contact_id, goal = %achievement.goal_config_id))]
    async fn record_achievement(&self, achievement: &GoalAchievement) -> Result<bool, StoreError> {
        insert_achievement(&self.pool, achievement).await
    }

    #[instrument(skip(self, lease, execution, achievement), fields(execution_id = %execution.id, goal = %achievement.goal_config_id))]
    async fn record_goal_exit(
        &self,
        lease: &Lease,
        execution: &WorkflowExecution,
        achievement: &GoalAchievement,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin goal exit"))?;
        lock_for_save(&mut tx, lease, execution).await?;
        if !insert_achievement(&mut *tx, achievement).await? {
            return Ok(false);
        }
        write_execution(&mut *tx, execution).await?;
        tx.commit().await.map_err(db_error("commit goal exit"))?;
        Ok(true)
    }

    async fn list_achievements(&self, contact_id: Uuid) -> Result<Vec<GoalAchievement>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, goal_config_id, goal_type, account_id, contact_id, workflow_id,
                   workflow_execution_id, trigger_event_type, event_data, achieved_at
            FROM goal_achievements WHERE contact_id = $1
            ORDER BY achieved_at, id
            "#,
        )
        .bind(contact_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list achievements"))?;
        rows.iter().map(achievement_from_row).collect()
    }
}

// =============================================================================
// Bulk jobs
// =============================================================================

#[async_trait]
impl BulkJobRepository for PostgresEngineStore {
    async fn insert_job(&self, job: &BulkEnrollmentJob) -> Result<(), StoreError> {
        let c = &job.counters;
        sqlx::query(
            r#"
            INSERT INTO bulk_enrollment_jobs (
                id, account_id, workflow_id, selection, options, status, batch_size,
                total_contacts, processed_count, success_count, failure_count, skipped_count,
                total_batches, completed_batches, failed_batches, error_message, created_at,
                started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(job.id)
        .bind(job.account_id)
        .bind(job.workflow_id)
        .bind(to_json(&job.selection)?)
        .bind(to_json(&job.options)?)
        .bind(job.status.as_str())
        .bind(job.batch_size as i32)
        .bind(c.total_contacts as i32)
        .bind(c.processed_count as i32)
        .bind(c.success_count as i32)
        .bind(c.failure_count as i32)
        .bind(c.skipped_count as i32)
        .bind(c.total_batches as i32)
        .bind(c.completed_batches as i32)
        .bind(c.failed_batches as i32)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("insert bulk job"))?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<BulkEnrollmentJob, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM bulk_enrollment_jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get bulk job"))?
            .ok_or(StoreError::JobNotFound(id))?;
        job_from_row(&row)
    }

    #[instrument(skip(self, from, error_message))]
    async fn transition_job(
        &self,
        id: Uuid,
        from: &[BulkJobStatus],
        to: BulkJobStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<BulkEnrollmentJob>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE bulk_enrollment_jobs
            SET status = $2,
                started_at = CASE WHEN $2 = 'processing' THEN COALESCE(started_at, $4) ELSE started_at END,
                completed_at = CASE WHEN $5 THEN $4 ELSE completed_at END,
                error_message = COALESCE($3, error_message)
            WHERE id = $1 AND status = ANY($6)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(to.as_str())
        .bind(error_message)
        .bind(now)
        .bind(to.is_terminal())
        .bind(status_texts(from))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("transition bulk job"))?;

        match row {
            Some(row) => Ok(Some(job_from_row(&row)?)),
            None if self.exists("bulk_enrollment_jobs", id).await? => Ok(None),
            None => Err(StoreError::JobNotFound(id)),
        }
    }

    async fn update_job_counters(&self, id: Uuid, counters: &JobCounters) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE bulk_enrollment_jobs
            SET total_contacts = $2, processed_count = $3, success_count = $4, failure_count = $5,
                skipped_count = $6, total_batches = $7, completed_batches = $8, failed_batches = $9
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(counters.total_contacts as i32)
        .bind(counters.processed_count as i32)
        .bind(counters.success_count as i32)
        .bind(counters.failure_count as i32)
        .bind(counters.skipped_count as i32)
        .bind(counters.total_batches as i32)
        .bind(counters.completed_batches as i32)
        .bind(counters.failed_batches as i32)
        .execute(&self.pool)
        .await
        .map_err(db_error("update job counters"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(id));
        }
        Ok(())
    }

    async fn insert_batches(&self, batches: &[BulkEnrollmentBatch]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin insert batches"))?;
        for batch in batches {
            sqlx::query(
                r#"
                INSERT INTO bulk_enrollment_batches (
                    id, job_id, batch_number, contact_ids, status, success_ids, failure_ids,
                    skipped_ids, attempt_count, error_message, started_at, completed_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(batch.id)
            .bind(batch.job_id)
            .bind(batch.batch_number as i32)
            .bind(&batch.contact_ids)
            .bind(batch.status.as_str())
            .bind(&batch.success_ids)
            .bind(&batch.failure_ids)
            .bind(&batch.skipped_ids)
            .bind(batch.attempt_count as i32)
            .bind(&batch.error_message)
            .bind(batch.started_at)
            .bind(batch.completed_at)
            .execute(&mut *tx)
            .await
            .map_err(db_error("insert batch"))?;
        }
        tx.commit().await.map_err(db_error("commit insert batches"))?;
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<BulkEnrollmentBatch, StoreError> {
        let row = sqlx::query(&format!("SELECT {BATCH_COLUMNS} FROM bulk_enrollment_batches WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get batch"))?
            .ok_or(StoreError::BatchNotFound(id))?;
        batch_from_row(&row)
    }

    async fn list_batches(&self, job_id: Uuid) -> Result<Vec<BulkEnrollmentBatch>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {BATCH_COLUMNS} FROM bulk_enrollment_batches WHERE job_id = $1 ORDER BY batch_number"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list batches"))?;
        rows.iter().map(batch_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn claim_batch(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<BulkEnrollmentBatch>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE bulk_enrollment_batches
            SET status = 'processing', attempt_count = attempt_count + 1, started_at = $2,
                completed_at = NULL, error_message = NULL
            WHERE id = $1 AND status = 'pending'
            RETURNING {BATCH_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("claim batch"))?;

        match row {
            Some(row) => Ok(Some(batch_from_row(&row)?)),
            None if self.exists("bulk_enrollment_batches", id).await? => Ok(None),
            None => Err(StoreError::BatchNotFound(id)),
        }
    }

    async fn save_batch(&self, batch: &BulkEnrollmentBatch) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE bulk_enrollment_batches
            SET status = $2, success_ids = $3, failure_ids = $4, skipped_ids = $5,
                attempt_count = $6, error_message = $7, started_at = $8, completed_at = $9
            WHERE id = $1
            "#,
        )
        .bind(batch.id)
        .bind(batch.status.as_str())
        .bind(&batch.success_ids)
        .bind(&batch.failure_ids)
        .bind(&batch.skipped_ids)
        .bind(batch.attempt_count as i32)
        .bind(&batch.error_message)
        .bind(batch.started_at)
        .bind(batch.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("save batch"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::BatchNotFound(batch.id));
        }
        Ok(())
    }

    async fn transition_batch(
        &self,
        id: Uuid,
        from: &[BatchStatus],
        to: BatchStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE bulk_enrollment_batches SET status = $2 WHERE id = $1 AND status = ANY($3)")
            .bind(id)
            .bind(to.as_str())
            .bind(status_texts(from))
            .execute(&self.pool)
            .await
            .map_err(db_error("transition batch"))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.exists("bulk_enrollment_batches", id).await? {
            Ok(false)
        } else {
            Err(StoreError::BatchNotFound(id))
        }
    }

    async fn insert_failure(&self, failure: &BulkEnrollmentFailure) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO bulk_enrollment_failures (
                id, job_id, batch_id, contact_id, error_code, error_message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (batch_id, contact_id) DO NOTHING
            "#,
        )
        .bind(failure.id)
        .bind(failure.job_id)
        .bind(failure.batch_id)
        .bind(failure.contact_id)
        .bind(&failure.error_code)
        .bind(&failure.error_message)
        .bind(failure.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("insert bulk failure"))?;
        Ok(())
    }

    async fn list_failures(&self, job_id: Uuid) -> Result<Vec<BulkEnrollmentFailure>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, batch_id, contact_id, error_code, error_message, created_at
            FROM bulk_enrollment_failures WHERE job_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list bulk failures"))?;

        Ok(rows
            .iter()
            .map(|row| BulkEnrollmentFailure {
                id: row.get("id"),
                job_id: row.get("job_id"),
                batch_id: row.get("batch_id"),
                contact_id: row.get("contact_id"),
                error_code: row.get("error_code"),
                error_message: row.get("error_message"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

// =============================================================================
// Versions and migrations
// =============================================================================

#[async_trait]
impl VersionRepository for PostgresEngineStore {
    async fn insert_version(&self, version: &WorkflowVersion) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_versions (
                id, workflow_id, account_id, version_number, status, is_current, definition,
                active_executions, change_summary, created_at, published_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(version.id)
        .bind(version.workflow_id)
        .bind(version.account_id)
        .bind(version.version_number as i32)
        .bind(version.status.as_str())
        .bind(version.is_current)
        .bind(to_json(&version.definition)?)
        .bind(version.active_executions)
        .bind(&version.change_summary)
        .bind(version.created_at)
        .bind(version.published_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(format!(
                    "workflow {} already has version {}",
                    version.workflow_id, version.version_number
                ))
            } else {
                db_error("insert version")(e)
            }
        })?;
        Ok(())
    }

    async fn get_version(&self, id: Uuid) -> Result<WorkflowVersion, StoreError> {
        let row = sqlx::query(&format!("SELECT {VERSION_COLUMNS} FROM workflow_versions WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get version"))?
            .ok_or(StoreError::VersionNotFound {
                workflow_id: Uuid::nil(),
                version: id.to_string(),
            })?;
        version_from_row(&row)
    }

    async fn get_version_by_number(&self, workflow_id: Uuid, number: u32) -> Result<WorkflowVersion, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_versions WHERE workflow_id = $1 AND version_number = $2"
        ))
        .bind(workflow_id)
        .bind(number as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get version by number"))?
        .ok_or(StoreError::VersionNotFound {
            workflow_id,
            version: number.to_string(),
        })?;
        version_from_row(&row)
    }

    async fn current_version(&self, workflow_id: Uuid) -> Result<Option<WorkflowVersion>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_versions WHERE workflow_id = $1 AND is_current"
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get current version"))?;
        row.as_ref().map(version_from_row).transpose()
    }

    async fn latest_version_number(&self, workflow_id: Uuid) -> Result<Option<u32>, StoreError> {
        let row = sqlx::query("SELECT MAX(version_number) AS latest FROM workflow_versions WHERE workflow_id = $1")
            .bind(workflow_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("get latest version number"))?;
        Ok(row.get::<Option<i32>, _>("latest").map(|n| n as u32))
    }

    async fn list_versions(&self, workflow_id: Uuid) -> Result<Vec<WorkflowVersion>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_versions WHERE workflow_id = $1 ORDER BY version_number"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list versions"))?;
        rows.iter().map(version_from_row).collect()
    }

    async fn list_current_versions(&self, account_id: Uuid) -> Result<Vec<WorkflowVersion>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_versions \
             WHERE account_id = $1 AND is_current AND status = 'active' ORDER BY workflow_id"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list current versions"))?;
        rows.iter().map(version_from_row).collect()
    }

    #[instrument(skip(self, migration))]
    async fn publish_version(
        &self,
        version_id: Uuid,
        migration: Option<&VersionMigration>,
        now: DateTime<Utc>,
    ) -> Result<WorkflowVersion, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin publish version"))?;

        let workflow_id: Uuid = sqlx::query("SELECT workflow_id FROM workflow_versions WHERE id = $1")
            .bind(version_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error("get version"))?
            .map(|row| row.get("workflow_id"))
            .ok_or(StoreError::VersionNotFound {
                workflow_id: Uuid::nil(),
                version: version_id.to_string(),
            })?;

        advisory_lock(&mut *tx, workflow_id).await?;
        if migration.is_some() {
            if let Some(migration_id) = active_migration_id(&mut *tx, workflow_id).await? {
                return Err(StoreError::MigrationInProgress {
                    workflow_id,
                    migration_id,
                });
            }
        }

        sqlx::query(
            r#"
            UPDATE workflow_versions SET is_current = FALSE, status = 'archived'
            WHERE workflow_id = $1 AND id <> $2 AND is_current
            "#,
        )
        .bind(workflow_id)
        .bind(version_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error("archive current version"))?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE workflow_versions SET is_current = TRUE, status = 'active', published_at = $2
            WHERE id = $1
            RETURNING {VERSION_COLUMNS}
            "#
        ))
        .bind(version_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("publish version"))?;
        let published = version_from_row(&row)?;

        if let Some(migration) = migration {
            insert_migration(&mut *tx, migration).await?;
        }
        tx.commit().await.map_err(db_error("commit publish version"))?;

        debug!(%workflow_id, version = published.version_number, "published version");
        Ok(published)
    }

    async fn deactivate_workflow(&self, workflow_id: Uuid, _now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE workflow_versions SET status = 'archived' WHERE workflow_id = $1 AND is_current")
            .bind(workflow_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("deactivate workflow"))?;
        Ok(())
    }

    async fn adjust_active_executions(&self, workflow_id: Uuid, version: u32, delta: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_versions SET active_executions = GREATEST(active_executions + $3, 0)
            WHERE workflow_id = $1 AND version_number = $2
            "#,
        )
        .bind(workflow_id)
        .bind(version as i32)
        .bind(delta)
        .execute(&self.pool)
        .await
        .map_err(db_error("adjust active executions"))?;
        Ok(())
    }

    async fn try_start_migration(&self, migration: &VersionMigration) -> Result<MigrationStart, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin start migration"))?;
        advisory_lock(&mut *tx, migration.workflow_id).await?;

        if let Some(active) = active_migration_id(&mut *tx, migration.workflow_id).await? {
            return Ok(MigrationStart::InProgress(active));
        }
        insert_migration(&mut *tx, migration).await?;
        tx.commit().await.map_err(db_error("commit start migration"))?;
        Ok(MigrationStart::Started)
    }

    async fn get_migration(&self, id: Uuid) -> Result<VersionMigration, StoreError> {
        let row = sqlx::query(&format!("SELECT {MIGRATION_COLUMNS} FROM version_migrations WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get migration"))?
            .ok_or(StoreError::MigrationNotFound(id))?;
        migration_from_row(&row)
    }

    async fn active_migration(&self, workflow_id: Uuid) -> Result<Option<VersionMigration>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MIGRATION_COLUMNS} FROM version_migrations \
             WHERE workflow_id = $1 AND status IN ('pending', 'running')"
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get active migration"))?;
        row.as_ref().map(migration_from_row).transpose()
    }

    #[instrument(skip(self, from, error_message))]
    async fn transition_migration(
        &self,
        id: Uuid,
        from: &[MigrationStatus],
        to: MigrationStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<VersionMigration>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE version_migrations
            SET status = $2,
                started_at = CASE WHEN $2 = 'running' THEN COALESCE(started_at, $4) ELSE started_at END,
                completed_at = CASE WHEN $5 THEN $4 ELSE completed_at END,
                error_message = COALESCE($3, error_message)
            WHERE id = $1 AND status = ANY($6)
            RETURNING {MIGRATION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(to.as_str())
        .bind(error_message)
        .bind(now)
        .bind(!to.is_active())
        .bind(status_texts(from))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("transition migration"))?;

        match row {
            Some(row) => Ok(Some(migration_from_row(&row)?)),
            None if self.exists("version_migrations", id).await? => Ok(None),
            None => Err(StoreError::MigrationNotFound(id)),
        }
    }

    async fn record_migration_progress(
        &self,
        id: Uuid,
        migrated: usize,
        failed: Vec<MigrationErrorEntry>,
        cursor: Option<Uuid>,
    ) -> Result<VersionMigration, StoreError> {
        let failed_count = failed.len() as i32;
        let row = sqlx::query(&format!(
            r#"
            UPDATE version_migrations
            SET contacts_migrated = contacts_migrated + $2,
                contacts_failed = contacts_failed + $3,
                error_log = error_log || $4::jsonb,
                cursor_id = COALESCE($5, cursor_id)
            WHERE id = $1
            RETURNING {MIGRATION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(migrated as i32)
        .bind(failed_count)
        .bind(to_json(&failed)?)
        .bind(cursor)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("record migration progress"))?
        .ok_or(StoreError::MigrationNotFound(id))?;
        migration_from_row(&row)
    }

    async fn set_migration_total(&self, id: Uuid, total: usize) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE version_migrations SET total_contacts = $2 WHERE id = $1")
            .bind(id)
            .bind(total as i32)
            .execute(&self.pool)
            .await
            .map_err(db_error("set migration total"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MigrationNotFound(id));
        }
        Ok(())
    }
}
