//! In-memory implementation of the engine repositories
//!
//! Useful for testing and single-process development. A single lock guards
//! all state, so every conditional update is trivially atomic.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use super::store::*;
use crate::model::{
    ActionExecution, BatchStatus, BulkEnrollmentBatch, BulkEnrollmentFailure, BulkEnrollmentJob,
    BulkJobStatus, ConditionLog, EventListener, ExecutionStatus, ExitReason, GoalAchievement,
    JobCounters, ListenerStatus, MigrationErrorEntry, MigrationStatus,
    VersionMigration, VersionStatus, WaitExecution, WaitStatus, WorkflowExecution,
    WorkflowVersion,
};

struct ExecutionRow {
    execution: WorkflowExecution,
    lease: Option<Lease>,
}

impl ExecutionRow {
    fn live_lease(&self, now: DateTime<Utc>) -> Option<&Lease> {
        self.lease.as_ref().filter(|l| l.expires_at > now)
    }
}

#[derive(Default)]
struct State {
    executions: HashMap<Uuid, ExecutionRow>,
    actions: HashMap<Uuid, ActionExecution>,
    condition_logs: Vec<ConditionLog>,
    waits: HashMap<Uuid, WaitExecution>,
    listeners: HashMap<Uuid, EventListener>,
    achievements: Vec<GoalAchievement>,
    jobs: HashMap<Uuid, BulkEnrollmentJob>,
    batches: HashMap<Uuid, BulkEnrollmentBatch>,
    failures: Vec<BulkEnrollmentFailure>,
    versions: HashMap<Uuid, WorkflowVersion>,
    migrations: HashMap<Uuid, VersionMigration>,
}

/// In-memory engine store
///
/// Provides the same conditional-update semantics as the PostgreSQL store.
pub struct InMemoryEngineStore {
    state: RwLock<State>,
}

impl InMemoryEngineStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    /// Number of stored executions (for testing)
    pub fn execution_count(&self) -> usize {
        self.state.read().executions.len()
    }

    /// Number of stored goal achievements (for testing)
    pub fn achievement_count(&self) -> usize {
        self.state.read().achievements.len()
    }

    /// All executions (for testing)
    pub fn all_executions(&self) -> Vec<WorkflowExecution> {
        let state = self.state.read();
        let mut executions: Vec<_> = state
            .executions
            .values()
            .map(|r| r.execution.clone())
            .collect();
        executions.sort_by_key(|e| e.id);
        executions
    }

    /// Drop the lease on an execution as if its holder crashed (for testing)
    pub fn expire_lease(&self, execution_id: Uuid) {
        let mut state = self.state.write();
        if let Some(row) = state.executions.get_mut(&execution_id) {
            if let Some(lease) = row.lease.as_mut() {
                lease.expires_at = Utc::now() - chrono::Duration::seconds(1);
            }
        }
    }
}

impl Default for InMemoryEngineStore {
    fn default() -> Self {
        Self::new()
    }
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(300))
}

/// The row `execution` may be written over under `lease`
fn checked_row<'s>(
    state: &'s mut State,
    lease: &Lease,
    execution: &WorkflowExecution,
) -> Result<&'s mut ExecutionRow, StoreError> {
    let row = state
        .executions
        .get_mut(&execution.id)
        .ok_or(StoreError::ExecutionNotFound(execution.id))?;

    if row.lease.as_ref().map(|l| l.token) != Some(lease.token) {
        return Err(StoreError::LeaseLost {
            execution_id: execution.id,
        });
    }
    let current = row.execution.status;
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
    Ok(row)
}

fn apply_wait_transition(state: &mut State, transition: &WaitTransition<'_>) -> Result<Option<WaitExecution>, StoreError> {
    let wait = state
        .waits
        .get_mut(&transition.wait_id)
        .ok_or(StoreError::WaitNotFound(transition.wait_id))?;

    if !transition.from.contains(&wait.status) {
        return Ok(None);
    }
    wait.status = transition.to;
    if transition.scheduled_at.is_some() {
        wait.scheduled_at = transition.scheduled_at;
    }
    if transition.pending_resume.is_some() {
        wait.pending_resume = transition.pending_resume;
    }
    if transition.resume_event.is_some() {
        wait.resume_event = transition.resume_event.clone();
    }
    if transition.error_message.is_some() {
        wait.error_message = transition.error_message.clone();
    }
    if transition.resumed_by.is_some() {
        wait.resumed_by = transition.resumed_by;
        wait.resumed_at = Some(transition.now);
    }
    Ok(Some(wait.clone()))
}

fn apply_listener_close(
    state: &mut State,
    id: Uuid,
    to: ListenerStatus,
    event: Option<Value>,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let listener = state
        .listeners
        .get_mut(&id)
        .ok_or(StoreError::ListenerNotFound(id))?;

    if listener.status != ListenerStatus::Active || to == ListenerStatus::Active {
        return Ok(false);
    }
    listener.status = to;
    if to == ListenerStatus::Matched {
        listener.matched_at = Some(now);
        listener.matched_event = event;
    }
    Ok(true)
}

#[async_trait]
impl ExecutionRepository for InMemoryEngineStore {
    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let duplicate = state.executions.values().any(|r| {
            r.execution.workflow_id == execution.workflow_id
                && r.execution.contact_id == execution.contact_id
                && !r.execution.is_terminal()
        });
        if duplicate && !execution.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "contact {} already has an open execution of workflow {}",
                execution.contact_id, execution.workflow_id
            )));
        }
        if state.executions.contains_key(&execution.id) {
            return Err(StoreError::Conflict(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        state.executions.insert(
            execution.id,
            ExecutionRow {
                execution: execution.clone(),
                lease: None,
            },
        );
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError> {
        self.state
            .read()
            .executions
            .get(&id)
            .map(|r| r.execution.clone())
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    async fn find_executions_for_contact(
        &self,
        workflow_id: Uuid,
        contact_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let state = self.state.read();
        let mut found: Vec<_> = state
            .executions
            .values()
            .filter(|r| r.execution.workflow_id == workflow_id && r.execution.contact_id == contact_id)
            .map(|r| r.execution.clone())
            .collect();
        found.sort_by_key(|e| e.id);
        Ok(found)
    }

    async fn list_open_executions_for_contact(
        &self,
        account_id: Uuid,
        contact_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let state = self.state.read();
        let mut found: Vec<_> = state
            .executions
            .values()
            .filter(|r| {
                r.execution.account_id == account_id
                    && r.execution.contact_id == contact_id
                    && !r.execution.is_terminal()
            })
            .map(|r| r.execution.clone())
            .collect();
        found.sort_by_key(|e| e.id);
        Ok(found)
    }

    async fn list_in_flight(
        &self,
        workflow_id: Uuid,
        version: u32,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let state = self.state.read();
        let mut found: Vec<_> = state
            .executions
            .values()
            .filter(|r| {
                r.execution.workflow_id == workflow_id
                    && r.execution.workflow_version == version
                    && !r.execution.is_terminal()
                    && after.map(|a| r.execution.id > a).unwrap_or(true)
            })
            .map(|r| r.execution.clone())
            .collect();
        found.sort_by_key(|e| e.id);
        found.truncate(limit);
        Ok(found)
    }

    async fn count_in_flight(&self, workflow_id: Uuid, version: u32) -> Result<usize, StoreError> {
        let state = self.state.read();
        Ok(state
            .executions
            .values()
            .filter(|r| {
                r.execution.workflow_id == workflow_id
                    && r.execution.workflow_version == version
                    && !r.execution.is_terminal()
            })
            .count())
    }

    async fn count_running(&self, account_id: Uuid) -> Result<usize, StoreError> {
        let state = self.state.read();
        Ok(state
            .executions
            .values()
            .filter(|r| r.execution.account_id == account_id && r.execution.status.is_running())
            .count())
    }

    async fn list_runnable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.read();
        let mut due: Vec<_> = state
            .executions
            .values()
            .filter(|r| {
                matches!(
                    r.execution.status,
                    ExecutionStatus::Queued | ExecutionStatus::Active
                ) && r.execution.next_run_at.map(|t| t <= now).unwrap_or(false)
                    && r.live_lease(now).is_none()
            })
            .map(|r| (r.execution.next_run_at, r.execution.id))
            .collect();
        due.sort();
        Ok(due.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn acquire_lease(&self, request: LeaseRequest<'_>) -> Result<LeaseOutcome, StoreError> {
        let mut state = self.state.write();
        let now = request.now;

        let (account_id, status) = {
            let row = state
                .executions
                .get(&request.execution_id)
                .ok_or(StoreError::ExecutionNotFound(request.execution_id))?;

            if row.execution.is_terminal() {
                return Ok(LeaseOutcome::Terminal(row.execution.status));
            }
            if let Some(lease) = row.live_lease(now) {
                return Ok(LeaseOutcome::Held {
                    owner: lease.owner.clone(),
                    expires_at: lease.expires_at,
                });
            }
            (row.execution.account_id, row.execution.status)
        };

        if let (ExecutionStatus::Queued, Some(limit)) = (status, request.start_limit) {
            let running = state
                .executions
                .values()
                .filter(|r| {
                    r.execution.account_id == account_id
                        && r.execution.id != request.execution_id
                        && (r.execution.status.is_running()
                            || (r.execution.status == ExecutionStatus::Queued
                                && r.live_lease(now).is_some()))
                })
                .count();
            if running >= limit {
                return Ok(LeaseOutcome::LimitReached { running });
            }
        }

        let lease = Lease {
            execution_id: request.execution_id,
            token: Uuid::now_v7(),
            owner: request.owner.to_string(),
            acquired_at: now,
            expires_at: now + chrono_ttl(request.ttl),
        };
        if let Some(row) = state.executions.get_mut(&request.execution_id) {
            row.lease = Some(lease.clone());
        }
        Ok(LeaseOutcome::Acquired(lease))
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> Result<Lease, StoreError> {
        let mut state = self.state.write();
        let row = state
            .executions
            .get_mut(&lease.execution_id)
            .ok_or(StoreError::ExecutionNotFound(lease.execution_id))?;

        match row.lease.as_mut() {
            Some(held) if held.token == lease.token => {
                held.expires_at = now + chrono_ttl(ttl);
                Ok(held.clone())
            }
            _ => Err(StoreError::LeaseLost {
                execution_id: lease.execution_id,
            }),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if let Some(row) = state.executions.get_mut(&lease.execution_id) {
            if row.lease.as_ref().map(|l| l.token) == Some(lease.token) {
                row.lease = None;
            }
        }
        Ok(())
    }

    async fn save_execution(&self, lease: &Lease, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let mut state = self.state.write();
        checked_row(&mut state, lease, execution)?.execution = execution.clone();
        Ok(())
    }

    async fn transition_execution(
        &self,
        id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let mut state = self.state.write();
        let row = state
            .executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;

        if !from.contains(&row.execution.status) || row.execution.transition(to, now).is_err() {
            return Ok(None);
        }
        if let Some(reason) = ExitReason::for_status(to) {
            row.execution.exit_reason = Some(reason);
        }
        if error_message.is_some() {
            row.execution.error_message = error_message;
        }
        Ok(Some(row.execution.clone()))
    }

    async fn insert_action_execution(&self, action: &ActionExecution) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let open = state.actions.values().any(|a| {
            a.workflow_execution_id == action.workflow_execution_id && !a.status.is_terminal()
        });
        if open && !action.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "execution {} already has an open action execution",
                action.workflow_execution_id
            )));
        }
        state.actions.insert(action.id, action.clone());
        Ok(())
    }

    async fn update_action_execution(&self, action: &ActionExecution) -> Result<(), StoreError> {
        let mut state = self.state.write();
        match state.actions.get_mut(&action.id) {
            Some(existing) => {
                *existing = action.clone();
                Ok(())
            }
            None => Err(StoreError::ActionExecutionNotFound(action.id)),
        }
    }

    async fn open_action_execution(&self, execution_id: Uuid) -> Result<Option<ActionExecution>, StoreError> {
        let state = self.state.read();
        Ok(state
            .actions
            .values()
            .find(|a| a.workflow_execution_id == execution_id && !a.status.is_terminal())
            .cloned())
    }

    async fn list_action_executions(&self, execution_id: Uuid) -> Result<Vec<ActionExecution>, StoreError> {
        let state = self.state.read();
        let mut actions: Vec<_> = state
            .actions
            .values()
            .filter(|a| a.workflow_execution_id == execution_id)
            .cloned()
            .collect();
        actions.sort_by_key(|a| a.id);
        Ok(actions)
    }

    async fn insert_condition_log(&self, log: &ConditionLog) -> Result<(), StoreError> {
        self.state.write().condition_logs.push(log.clone());
        Ok(())
    }

    async fn list_condition_logs(&self, execution_id: Uuid) -> Result<Vec<ConditionLog>, StoreError> {
        let state = self.state.read();
        Ok(state
            .condition_logs
            .iter()
            .filter(|l| l.workflow_execution_id == execution_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WaitRepository for InMemoryEngineStore {
    async fn insert_wait(&self, wait: &WaitExecution) -> Result<WaitInsert, StoreError> {
        let mut state = self.state.write();
        if let Some(existing) = state.waits.values().find(|w| {
            w.workflow_execution_id == wait.workflow_execution_id && w.step_id == wait.step_id
        }) {
            return Ok(WaitInsert::Existing(existing.clone()));
        }
        state.waits.insert(wait.id, wait.clone());
        Ok(WaitInsert::Inserted)
    }

    async fn get_wait(&self, id: Uuid) -> Result<WaitExecution, StoreError> {
        self.state
            .read()
            .waits
            .get(&id)
            .cloned()
            .ok_or(StoreError::WaitNotFound(id))
    }

    async fn open_wait_for_execution(&self, execution_id: Uuid) -> Result<Option<WaitExecution>, StoreError> {
        let state = self.state.read();
        Ok(state
            .waits
            .values()
            .find(|w| w.workflow_execution_id == execution_id && w.status.is_open())
            .cloned())
    }

    async fn list_due_waits(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WaitExecution>, StoreError> {
        let state = self.state.read();
        let mut due: Vec<_> = state
            .waits
            .values()
            .filter(|w| {
                w.status == WaitStatus::Scheduled && w.scheduled_at.map(|t| t <= now).unwrap_or(false)
            })
            .cloned()
            .collect();
        due.sort_by_key(|w| (w.scheduled_at, w.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn transition_wait(&self, transition: WaitTransition<'_>) -> Result<Option<WaitExecution>, StoreError> {
        apply_wait_transition(&mut self.state.write(), &transition)
    }
}

#[async_trait]
impl EventListenerRepository for InMemoryEngineStore {
    async fn insert_listener(&self, listener: &EventListener) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.listeners.values().any(|l| {
            l.wait_execution_id == listener.wait_execution_id && l.event_type == listener.event_type
        }) {
            return Err(StoreError::Conflict(format!(
                "wait {} already listens for {}",
                listener.wait_execution_id, listener.event_type
            )));
        }
        state.listeners.insert(listener.id, listener.clone());
        Ok(())
    }

    async fn get_listener(&self, id: Uuid) -> Result<EventListener, StoreError> {
        self.state
            .read()
            .listeners
            .get(&id)
            .cloned()
            .ok_or(StoreError::ListenerNotFound(id))
    }

    async fn find_listener_for_wait(&self, wait_execution_id: Uuid) -> Result<Option<EventListener>, StoreError> {
        let state = self.state.read();
        Ok(state
            .listeners
            .values()
            .find(|l| l.wait_execution_id == wait_execution_id)
            .cloned())
    }

    async fn find_active_listeners(
        &self,
        event_type: &str,
        contact_id: Uuid,
    ) -> Result<Vec<EventListener>, StoreError> {
        let state = self.state.read();
        let mut found: Vec<_> = state
            .listeners
            .values()
            .filter(|l| {
                l.status == ListenerStatus::Active
                    && l.event_type == event_type
                    && l.contact_id == contact_id
            })
            .cloned()
            .collect();
        found.sort_by_key(|l| l.id);
        Ok(found)
    }

    async fn list_expired_listeners(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventListener>, StoreError> {
        let state = self.state.read();
        let mut found: Vec<_> = state
            .listeners
            .values()
            .filter(|l| l.status == ListenerStatus::Active && l.is_expired_at(now))
            .cloned()
            .collect();
        found.sort_by_key(|l| (l.expires_at, l.id));
        found.truncate(limit);
        Ok(found)
    }

    async fn close_listener(
        &self,
        id: Uuid,
        to: ListenerStatus,
        event: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        apply_listener_close(&mut self.state.write(), id, to, event, now)
    }

    async fn close_listener_with_wait(
        &self,
        id: Uuid,
        to: ListenerStatus,
        event: Option<Value>,
        transition: WaitTransition<'_>,
    ) -> Result<ListenerClose, StoreError> {
        let mut state = self.state.write();
        if !state.waits.contains_key(&transition.wait_id) {
            return Err(StoreError::WaitNotFound(transition.wait_id));
        }
        if !apply_listener_close(&mut state, id, to, event, transition.now)? {
            return Ok(ListenerClose::AlreadyClosed);
        }
        Ok(ListenerClose::Closed(apply_wait_transition(&mut state, &transition)?))
    }
}

#[async_trait]
impl GoalRepository for InMemoryEngineStore {
    async fn has_achievement(&self, contact_id: Uuid, goal_config_id: Uuid) -> Result<bool, StoreError> {
        let state = self.state.read();
        Ok(state
            .achievements
            .iter()
            .any(|a| a.contact_id == contact_id && a.goal_config_id == goal_config_id))
    }

    async fn record_achievement(&self, achievement: &GoalAchievement) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let exists = state.achievements.iter().any(|a| {
            a.contact_id == achievement.contact_id && a.goal_config_id == achievement.goal_config_id
        });
        if exists {
            return Ok(false);
        }
        state.achievements.push(achievement.clone());
        Ok(true)
    }

    async fn record_goal_exit(
        &self,
        lease: &Lease,
        execution: &WorkflowExecution,
        achievement: &GoalAchievement,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        checked_row(&mut state, lease, execution)?;
        let exists = state.achievements.iter().any(|a| {
            a.contact_id == achievement.contact_id && a.goal_config_id == achievement.goal_config_id
        });
        if exists {
            return Ok(false);
        }
        checked_row(&mut state, lease, execution)?.execution = execution.clone();
        state.achievements.push(achievement.clone());
        Ok(true)
    }

    async fn list_achievements(&self, contact_id: Uuid) -> Result<Vec<GoalAchievement>, StoreError> {
        let state = self.state.read();
        Ok(state
            .achievements
            .iter()
            .filter(|a| a.contact_id == contact_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BulkJobRepository for InMemoryEngineStore {
    async fn insert_job(&self, job: &BulkEnrollmentJob) -> Result<(), StoreError> {
        self.state.write().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<BulkEnrollmentJob, StoreError> {
        self.state
            .read()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(StoreError::JobNotFound(id))
    }

    async fn transition_job(
        &self,
        id: Uuid,
        from: &[BulkJobStatus],
        to: BulkJobStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<BulkEnrollmentJob>, StoreError> {
        let mut state = self.state.write();
        let job = state.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;

        if !from.contains(&job.status) {
            return Ok(None);
        }
        job.status = to;
        if to == BulkJobStatus::Processing && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if to.is_terminal() {
            job.completed_at = Some(now);
        }
        if error_message.is_some() {
            job.error_message = error_message;
        }
        Ok(Some(job.clone()))
    }

    async fn update_job_counters(&self, id: Uuid, counters: &JobCounters) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let job = state.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.counters = *counters;
        Ok(())
    }

    async fn insert_batches(&self, batches: &[BulkEnrollmentBatch]) -> Result<(), StoreError> {
        let mut state = self.state.write();
        for batch in batches {
            state.batches.insert(batch.id, batch.clone());
        }
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> Result<BulkEnrollmentBatch, StoreError> {
        self.state
            .read()
            .batches
            .get(&id)
            .cloned()
            .ok_or(StoreError::BatchNotFound(id))
    }

    async fn list_batches(&self, job_id: Uuid) -> Result<Vec<BulkEnrollmentBatch>, StoreError> {
        let state = self.state.read();
        let mut batches: Vec<_> = state
            .batches
            .values()
            .filter(|b| b.job_id == job_id)
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.batch_number);
        Ok(batches)
    }

    async fn claim_batch(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<BulkEnrollmentBatch>, StoreError> {
        let mut state = self.state.write();
        let batch = state.batches.get_mut(&id).ok_or(StoreError::BatchNotFound(id))?;

        if batch.status != BatchStatus::Pending {
            return Ok(None);
        }
        batch.status = BatchStatus::Processing;
        batch.attempt_count += 1;
        batch.started_at = Some(now);
        batch.completed_at = None;
        batch.error_message = None;
        Ok(Some(batch.clone()))
    }

    async fn save_batch(&self, batch: &BulkEnrollmentBatch) -> Result<(), StoreError> {
        let mut state = self.state.write();
        match state.batches.get_mut(&batch.id) {
            Some(existing) => {
                *existing = batch.clone();
                Ok(())
            }
            None => Err(StoreError::BatchNotFound(batch.id)),
        }
    }

    async fn transition_batch(
        &self,
        id: Uuid,
        from: &[BatchStatus],
        to: BatchStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let batch = state.batches.get_mut(&id).ok_or(StoreError::BatchNotFound(id))?;
        if !from.contains(&batch.status) {
            return Ok(false);
        }
        batch.status = to;
        Ok(true)
    }

    async fn insert_failure(&self, failure: &BulkEnrollmentFailure) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let exists = state
            .failures
            .iter()
            .any(|f| f.batch_id == failure.batch_id && f.contact_id == failure.contact_id);
        if !exists {
            state.failures.push(failure.clone());
        }
        Ok(())
    }

    async fn list_failures(&self, job_id: Uuid) -> Result<Vec<BulkEnrollmentFailure>, StoreError> {
        let state = self.state.read();
        Ok(state
            .failures
            .iter()
            .filter(|f| f.job_id == job_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl VersionRepository for InMemoryEngineStore {
    async fn insert_version(&self, version: &WorkflowVersion) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.versions.values().any(|v| {
            v.workflow_id == version.workflow_id && v.version_number == version.version_number
        }) {
            return Err(StoreError::Conflict(format!(
                "workflow {} already has version {}",
                version.workflow_id, version.version_number
            )));
        }
        state.versions.insert(version.id, version.clone());
        Ok(())
    }

    async fn get_version(&self, id: Uuid) -> Result<WorkflowVersion, StoreError> {
        self.state
            .read()
            .versions
            .get(&id)
            .cloned()
            .ok_or(StoreError::VersionNotFound {
                workflow_id: Uuid::nil(),
                version: id.to_string(),
            })
    }

    async fn get_version_by_number(&self, workflow_id: Uuid, number: u32) -> Result<WorkflowVersion, StoreError> {
        self.state
            .read()
            .versions
            .values()
            .find(|v| v.workflow_id == workflow_id && v.version_number == number)
            .cloned()
            .ok_or(StoreError::VersionNotFound {
                workflow_id,
                version: number.to_string(),
            })
    }

    async fn current_version(&self, workflow_id: Uuid) -> Result<Option<WorkflowVersion>, StoreError> {
        Ok(self
            .state
            .read()
            .versions
            .values()
            .find(|v| v.workflow_id == workflow_id && v.is_current)
            .cloned())
    }

    async fn latest_version_number(&self, workflow_id: Uuid) -> Result<Option<u32>, StoreError> {
        Ok(self
            .state
            .read()
            .versions
            .values()
            .filter(|v| v.workflow_id == workflow_id)
            .map(|v| v.version_number)
            .max())
    }

    async fn list_versions(&self, workflow_id: Uuid) -> Result<Vec<WorkflowVersion>, StoreError> {
        let state = self.state.read();
        let mut versions: Vec<_> = state
            .versions
            .values()
            .filter(|v| v.workflow_id == workflow_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.version_number);
        Ok(versions)
    }

    async fn list_current_versions(&self, account_id: Uuid) -> Result<Vec<WorkflowVersion>, StoreError> {
        let state = self.state.read();
        let mut versions: Vec<_> = state
            .versions
            .values()
            .filter(|v| v.account_id == account_id && v.is_current && v.status == VersionStatus::Active)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.workflow_id);
        Ok(versions)
    }

    async fn publish_version(
        &self,
        version_id: Uuid,
        migration: Option<&VersionMigration>,
        now: DateTime<Utc>,
    ) -> Result<WorkflowVersion, StoreError> {
        let mut state = self.state.write();
        let workflow_id = state
            .versions
            .get(&version_id)
            .map(|v| v.workflow_id)
            .ok_or(StoreError::VersionNotFound {
                workflow_id: Uuid::nil(),
                version: version_id.to_string(),
            })?;

        if migration.is_some() {
            if let Some(active) = state
                .migrations
                .values()
                .find(|m| m.workflow_id == workflow_id && m.status.is_active())
            {
                return Err(StoreError::MigrationInProgress {
                    workflow_id,
                    migration_id: active.id,
                });
            }
        }

        for version in state.versions.values_mut() {
            if version.workflow_id == workflow_id && version.id != version_id && version.is_current {
                version.is_current = false;
                version.status = VersionStatus::Archived;
            }
        }

        let published = match state.versions.get_mut(&version_id) {
            Some(version) => {
                version.is_current = true;
                version.status = VersionStatus::Active;
                version.published_at = Some(now);
                version.clone()
            }
            None => {
                return Err(StoreError::VersionNotFound {
                    workflow_id,
                    version: version_id.to_string(),
                })
            }
        };

        if let Some(migration) = migration {
            state.migrations.insert(migration.id, migration.clone());
        }
        Ok(published)
    }

    async fn deactivate_workflow(&self, workflow_id: Uuid, _now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.write();
        for version in state.versions.values_mut() {
            if version.workflow_id == workflow_id && version.is_current {
                version.status = VersionStatus::Archived;
            }
        }
        Ok(())
    }

    async fn adjust_active_executions(&self, workflow_id: Uuid, version: u32, delta: i64) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if let Some(v) = state
            .versions
            .values_mut()
            .find(|v| v.workflow_id == workflow_id && v.version_number == version)
        {
            v.active_executions = (v.active_executions + delta).max(0);
        }
        Ok(())
    }

    async fn try_start_migration(&self, migration: &VersionMigration) -> Result<MigrationStart, StoreError> {
        let mut state = self.state.write();
        if let Some(active) = state
            .migrations
            .values()
            .find(|m| m.workflow_id == migration.workflow_id && m.status.is_active())
        {
            return Ok(MigrationStart::InProgress(active.id));
        }
        state.migrations.insert(migration.id, migration.clone());
        Ok(MigrationStart::Started)
    }

    async fn get_migration(&self, id: Uuid) -> Result<VersionMigration, StoreError> {
        self.state
            .read()
            .migrations
            .get(&id)
            .cloned()
            .ok_or(StoreError::MigrationNotFound(id))
    }

    async fn active_migration(&self, workflow_id: Uuid) -> Result<Option<VersionMigration>, StoreError> {
        Ok(self
            .state
            .read()
            .migrations
            .values()
            .find(|m| m.workflow_id == workflow_id && m.status.is_active())
            .cloned())
    }

    async fn transition_migration(
        &self,
        id: Uuid,
        from: &[MigrationStatus],
        to: MigrationStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<VersionMigration>, StoreError> {
        let mut state = self.state.write();
        let migration = state
            .migrations
            .get_mut(&id)
            .ok_or(StoreError::MigrationNotFound(id))?;

        if !from.contains(&migration.status) {
            return Ok(None);
        }
        migration.status = to;
        if to == MigrationStatus::Running && migration.started_at.is_none() {
            migration.started_at = Some(now);
        }
        if !to.is_active() {
            migration.completed_at = Some(now);
        }
        if error_message.is_some() {
            migration.error_message = error_message;
        }
        Ok(Some(migration.clone()))
    }

    async fn record_migration_progress(
        &self,
        id: Uuid,
        migrated: usize,
        failed: Vec<MigrationErrorEntry>,
        cursor: Option<Uuid>,
    ) -> Result<VersionMigration, StoreError> {
        let mut state = self.state.write();
        let migration = state
            .migrations
            .get_mut(&id)
            .ok_or(StoreError::MigrationNotFound(id))?;

        migration.contacts_migrated += migrated;
        migration.contacts_failed += failed.len();
        migration.error_log.extend(failed);
        if cursor.is_some() {
            migration.cursor = cursor;
        }
        Ok(migration.clone())
    }

    async fn set_migration_total(&self, id: Uuid, total: usize) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let migration = state
            .migrations
            .get_mut(&id)
            .ok_or(StoreError::MigrationNotFound(id))?;
        migration.total_contacts = total;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{GoalConfig, GoalCriteria, GoalType, WorkflowDefinition};
    use crate::model::{EnrollmentSource, ResumedBy, WaitType};

    fn definition(account_id: Uuid) -> WorkflowDefinition {
        WorkflowDefinition::new(Uuid::now_v7(), account_id, 1)
    }

    fn request(execution_id: Uuid, owner: &str, start_limit: Option<usize>) -> LeaseRequest<'_> {
        LeaseRequest {
            execution_id,
            owner,
            ttl: Duration::from_secs(60),
            now: Utc::now(),
            start_limit,
        }
    }

    async fn insert(store: &InMemoryEngineStore, def: &WorkflowDefinition) -> WorkflowExecution {
        let exec = WorkflowExecution::new(def, Uuid::now_v7(), EnrollmentSource::Api);
        store.insert_execution(&exec).await.unwrap();
        exec
    }

    fn acquired(outcome: LeaseOutcome) -> Lease {
        match outcome {
            LeaseOutcome::Acquired(lease) => lease,
            other => panic!("expected lease, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_open_execution_rejected() {
        let store = InMemoryEngineStore::new();
        let def = definition(Uuid::now_v7());
        let exec = insert(&store, &def).await;

        let mut again = WorkflowExecution::new(&def, exec.contact_id, EnrollmentSource::Api);
        again.id = Uuid::now_v7();
        assert!(matches!(
            store.insert_execution(&again).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let store = InMemoryEngineStore::new();
        let def = definition(Uuid::now_v7());
        let exec = insert(&store, &def).await;

        let lease = acquired(store.acquire_lease(request(exec.id, "w1", None)).await.unwrap());
        let second = store.acquire_lease(request(exec.id, "w2", None)).await.unwrap();
        assert!(matches!(second, LeaseOutcome::Held { ref owner, .. } if owner == "w1"));

        store.release_lease(&lease).await.unwrap();
        acquired(store.acquire_lease(request(exec.id, "w2", None)).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = InMemoryEngineStore::new();
        let def = definition(Uuid::now_v7());
        let exec = insert(&store, &def).await;

        let stale = acquired(store.acquire_lease(request(exec.id, "w1", None)).await.unwrap());
        store.expire_lease(exec.id);
        let fresh = acquired(store.acquire_lease(request(exec.id, "w2", None)).await.unwrap());

        // The crashed owner can no longer write
        let result = store.save_execution(&stale, &exec).await;
        assert_eq!(
            result,
            Err(StoreError::LeaseLost {
                execution_id: exec.id
            })
        );
        assert!(store.save_execution(&fresh, &exec).await.is_ok());
    }

    #[tokio::test]
    async fn test_start_limit_counts_running_executions() {
        let store = InMemoryEngineStore::new();
        let account = Uuid::now_v7();
        let def = definition(account);

        let first = insert(&store, &def).await;
        let second = insert(&store, &def).await;

        let lease = acquired(store.acquire_lease(request(first.id, "w1", Some(1))).await.unwrap());
        let mut running = first.clone();
        running.transition(ExecutionStatus::Active, Utc::now()).unwrap();
        store.save_execution(&lease, &running).await.unwrap();
        store.release_lease(&lease).await.unwrap();

        let outcome = store.acquire_lease(request(second.id, "w1", Some(1))).await.unwrap();
        assert_eq!(outcome, LeaseOutcome::LimitReached { running: 1 });
        assert_eq!(store.count_running(account).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_terminal_execution_is_never_overwritten() {
        let store = InMemoryEngineStore::new();
        let def = definition(Uuid::now_v7());
        let exec = insert(&store, &def).await;
        let lease = acquired(store.acquire_lease(request(exec.id, "w1", None)).await.unwrap());

        let cancelled = store
            .transition_execution(
                exec.id,
                &ExecutionStatus::NON_TERMINAL,
                ExecutionStatus::Cancelled,
                None,
                Utc::now(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.exit_reason, Some(ExitReason::Cancelled));

        let mut active = exec.clone();
        active.transition(ExecutionStatus::Active, Utc::now()).unwrap();
        assert_eq!(
            store.save_execution(&lease, &active).await,
            Err(StoreError::TerminalState {
                execution_id: exec.id,
                status: ExecutionStatus::Cancelled
            })
        );
        assert_eq!(
            store.acquire_lease(request(exec.id, "w2", None)).await.unwrap(),
            LeaseOutcome::Terminal(ExecutionStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_one_open_action_per_execution() {
        let store = InMemoryEngineStore::new();
        let exec_id = Uuid::now_v7();
        let first = ActionExecution::new(exec_id, "a", "send_email");
        store.insert_action_execution(&first).await.unwrap();

        let second = ActionExecution::new(exec_id, "b", "add_tag");
        assert!(matches!(
            store.insert_action_execution(&second).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_unique_per_step() {
        let store = InMemoryEngineStore::new();
        let exec_id = Uuid::now_v7();
        let wait = WaitExecution::new(exec_id, "pause", Uuid::now_v7(), Uuid::now_v7(), WaitType::FixedTime);

        assert_eq!(store.insert_wait(&wait).await.unwrap(), WaitInsert::Inserted);

        let retry = WaitExecution::new(exec_id, "pause", wait.account_id, wait.contact_id, WaitType::FixedTime);
        assert_eq!(
            store.insert_wait(&retry).await.unwrap(),
            WaitInsert::Existing(wait)
        );
    }

    #[tokio::test]
    async fn test_listener_closes_exactly_once() {
        let store = InMemoryEngineStore::new();
        let mut wait = WaitExecution::new(Uuid::now_v7(), "w", Uuid::now_v7(), Uuid::now_v7(), WaitType::ForEvent);
        wait.event_type = Some("email_opened".into());
        let listener = EventListener::for_wait(&wait, vec![]);
        store.insert_listener(&listener).await.unwrap();

        let now = Utc::now();
        assert!(store
            .close_listener(listener.id, ListenerStatus::Matched, None, now)
            .await
            .unwrap());
        assert!(!store
            .close_listener(listener.id, ListenerStatus::Expired, None, now)
            .await
            .unwrap());
        assert_eq!(
            store.get_listener(listener.id).await.unwrap().status,
            ListenerStatus::Matched
        );
    }

    #[tokio::test]
    async fn test_listener_close_and_wait_schedule_commit_together() {
        let store = InMemoryEngineStore::new();
        let mut wait = WaitExecution::new(Uuid::now_v7(), "w", Uuid::now_v7(), Uuid::now_v7(), WaitType::ForEvent);
        wait.status = WaitStatus::Waiting;
        wait.event_type = Some("email_opened".into());
        store.insert_wait(&wait).await.unwrap();
        let listener = EventListener::for_wait(&wait, vec![]);
        store.insert_listener(&listener).await.unwrap();

        let now = Utc::now();
        let schedule = |wait_id| {
            let mut t = WaitTransition::new(wait_id, &[WaitStatus::Waiting], WaitStatus::Scheduled, now);
            t.scheduled_at = Some(now);
            t.pending_resume = Some(ResumedBy::Event);
            t
        };

        // A failing wait half leaves the listener open
        let missing = Uuid::now_v7();
        assert_eq!(
            store
                .close_listener_with_wait(listener.id, ListenerStatus::Matched, None, schedule(missing))
                .await,
            Err(StoreError::WaitNotFound(missing))
        );
        assert_eq!(
            store.get_listener(listener.id).await.unwrap().status,
            ListenerStatus::Active
        );

        let closed = store
            .close_listener_with_wait(listener.id, ListenerStatus::Matched, None, schedule(wait.id))
            .await
            .unwrap();
        let ListenerClose::Closed(Some(scheduled)) = closed else {
            panic!("expected scheduled wait, got {:?}", closed);
        };
        assert_eq!(scheduled.status, WaitStatus::Scheduled);
        assert_eq!(scheduled.pending_resume, Some(ResumedBy::Event));

        // The losing resumer writes nothing
        let again = store
            .close_listener_with_wait(listener.id, ListenerStatus::Expired, None, schedule(wait.id))
            .await
            .unwrap();
        assert_eq!(again, ListenerClose::AlreadyClosed);
        assert_eq!(
            store.get_listener(listener.id).await.unwrap().status,
            ListenerStatus::Matched
        );
        assert_eq!(store.get_wait(wait.id).await.unwrap(), scheduled);
    }

    #[tokio::test]
    async fn test_goal_exit_is_all_or_nothing() {
        let store = InMemoryEngineStore::new();
        let def = definition(Uuid::now_v7());
        let exec = insert(&store, &def).await;
        let lease = acquired(store.acquire_lease(request(exec.id, "w1", None)).await.unwrap());
        let goal = GoalConfig::new(GoalType::TagAdded, GoalCriteria::default());
        let achievement =
            GoalAchievement::new(&goal, def.account_id, exec.contact_id, def.workflow_id, exec.id);

        // Queued cannot complete directly; nothing is recorded
        let mut skipped = exec.clone();
        skipped.status = ExecutionStatus::Completed;
        assert!(matches!(
            store.record_goal_exit(&lease, &skipped, &achievement).await,
            Err(StoreError::InvalidTransition { .. })
        ));
        assert_eq!(store.achievement_count(), 0);

        let mut finished = exec.clone();
        finished.transition(ExecutionStatus::Active, Utc::now()).unwrap();
        finished
            .finish(ExecutionStatus::Completed, ExitReason::GoalAchieved, None, Utc::now())
            .unwrap();
        assert!(store.record_goal_exit(&lease, &finished, &achievement).await.unwrap());
        assert_eq!(store.achievement_count(), 1);
        assert_eq!(
            store.get_execution(exec.id).await.unwrap().status,
            ExecutionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_achievement_insert_if_absent() {
        let store = InMemoryEngineStore::new();
        let goal = GoalConfig::new(GoalType::TagAdded, GoalCriteria::default());
        let contact = Uuid::now_v7();
        let a = GoalAchievement::new(&goal, Uuid::now_v7(), contact, Uuid::now_v7(), Uuid::now_v7());
        let b = GoalAchievement::new(&goal, a.account_id, contact, a.workflow_id, Uuid::now_v7());

        assert!(store.record_achievement(&a).await.unwrap());
        assert!(!store.record_achievement(&b).await.unwrap());
        assert_eq!(store.achievement_count(), 1);
        assert!(store.has_achievement(contact, goal.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_claim_is_cas() {
        let store = InMemoryEngineStore::new();
        let batch = BulkEnrollmentBatch::new(Uuid::now_v7(), 1, vec![Uuid::now_v7()]);
        store.insert_batches(std::slice::from_ref(&batch)).await.unwrap();

        let claimed = store.claim_batch(batch.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.attempt_count, 1);
        assert!(store.claim_batch(batch.id, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_archives_previous_current() {
        let store = InMemoryEngineStore::new();
        let workflow_id = Uuid::now_v7();
        let account_id = Uuid::now_v7();
        let v1 = WorkflowVersion::draft(WorkflowDefinition::new(workflow_id, account_id, 1), None);
        let v2 = WorkflowVersion::draft(WorkflowDefinition::new(workflow_id, account_id, 2), None);
        store.insert_version(&v1).await.unwrap();
        store.insert_version(&v2).await.unwrap();

        store.publish_version(v1.id, None, Utc::now()).await.unwrap();
        store.publish_version(v2.id, None, Utc::now()).await.unwrap();

        let current = store.current_version(workflow_id).await.unwrap().unwrap();
        assert_eq!(current.version_number, 2);
        assert_eq!(
            store.get_version(v1.id).await.unwrap().status,
            VersionStatus::Archived
        );
        assert_eq!(store.latest_version_number(workflow_id).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_only_one_active_migration() {
        let store = InMemoryEngineStore::new();
        let workflow_id = Uuid::now_v7();
        let account_id = Uuid::now_v7();
        let v1 = WorkflowVersion::draft(WorkflowDefinition::new(workflow_id, account_id, 1), None);
        let v2 = WorkflowVersion::draft(WorkflowDefinition::new(workflow_id, account_id, 2), None);

        let first = VersionMigration::new(&v1, &v2, crate::model::MigrationStrategy::Manual, Default::default(), 10);
        let second = VersionMigration::new(&v1, &v2, crate::model::MigrationStrategy::Manual, Default::default(), 10);

        assert_eq!(store.try_start_migration(&first).await.unwrap(), MigrationStart::Started);
        assert_eq!(
            store.try_start_migration(&second).await.unwrap(),
            MigrationStart::InProgress(first.id)
        );
    }
}
