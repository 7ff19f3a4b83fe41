//! Execution stepper
//!
//! Claims one execution under a lease and moves it through the graph one
//! node at a time. Every write goes through the lease, so two steps of the
//! same execution never run concurrently; a lost lease or a cooperative
//! cancellation surfaces as a store error on the next save.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::error::EngineError;
use crate::collaborators::{
    ActionDispatcher, ContactStore, DefinitionStore, DispatchContext, DispatchError, DispatchStatus,
};
use crate::condition::{self, EvaluationContext};
use crate::config::EngineConfig;
use crate::contact::ContactSnapshot;
use crate::definition::{
    ActionNode, ConditionNode, DefinitionError, GoalConfig, Node, NodeKind, WaitNode,
    WorkflowDefinition,
};
use crate::events::InboundEvent;
use crate::goal::{self, GoalSignal};
use crate::model::{
    ActionExecution, ActionStatus, ConditionLog, ExecutionStatus, ExitReason, GoalAchievement,
    ResumedBy, WaitExecution, WaitStatus, WorkflowExecution,
};
use crate::persistence::{EngineStore, Lease, LeaseOutcome, LeaseRequest, StoreError};
use crate::reliability::{RetryPolicy, TimeoutError};
use crate::scheduler::WaitScheduler;

/// An execution held under a lease, with the contact snapshot it runs against
#[derive(Debug, Clone)]
pub struct ClaimedExecution {
    pub lease: Lease,
    pub execution: WorkflowExecution,
    pub contact: ContactSnapshot,
}

/// What one advance (or one drive) did
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Moved past one node; more work is due now
    Advanced,
    /// Suspended at a wait node; the lease is released
    Waiting { wait_id: Uuid },
    /// An action failed and will be attempted again
    RetryScheduled { attempt: u32, at: DateTime<Utc> },
    Completed { exit_reason: ExitReason },
    Failed { error: String },
    Cancelled { reason: String },
    /// Nothing to do: the execution is already in this status
    Stopped { status: ExecutionStatus },
    /// Step budget used up; the execution stays runnable
    Yielded,
}

impl ExecutionOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionOutcome::Completed { .. }
                | ExecutionOutcome::Failed { .. }
                | ExecutionOutcome::Cancelled { .. }
        )
    }
}

/// Moves executions through their workflow graph
pub struct Stepper {
    store: Arc<dyn EngineStore>,
    definitions: Arc<dyn DefinitionStore>,
    contacts: Arc<dyn ContactStore>,
    dispatcher: Arc<dyn ActionDispatcher>,
    waits: Arc<WaitScheduler>,
    config: Arc<EngineConfig>,
}

impl Stepper {
    pub fn new(
        store: Arc<dyn EngineStore>,
        definitions: Arc<dyn DefinitionStore>,
        contacts: Arc<dyn ContactStore>,
        dispatcher: Arc<dyn ActionDispatcher>,
        waits: Arc<WaitScheduler>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            definitions,
            contacts,
            dispatcher,
            waits,
            config,
        }
    }

    // =========================================================================
    // Claiming
    // =========================================================================

    /// Acquire the lease on an execution and check its preconditions
    ///
    /// A queued execution is only claimed while its account is under the
    /// concurrency ceiling. An inactive workflow, a missing contact or an
    /// opted-out contact cancels the execution and returns the precondition
    /// error.
    #[instrument(skip(self))]
    pub async fn claim(&self, execution_id: Uuid) -> Result<ClaimedExecution, EngineError> {
        let limit = self.config.max_concurrent_executions_per_account;
        let request = LeaseRequest {
            execution_id,
            owner: &self.config.worker_id,
            ttl: self.config.lease_ttl,
            now: Utc::now(),
            start_limit: Some(limit),
        };

        let lease = match self.store.acquire_lease(request).await? {
            LeaseOutcome::Acquired(lease) => lease,
            LeaseOutcome::Held { owner, .. } => {
                return Err(EngineError::ExecutionLocked {
                    execution_id,
                    owner,
                })
            }
            LeaseOutcome::LimitReached { running } => {
                let execution = self.store.get_execution(execution_id).await?;
                return Err(EngineError::ConcurrentExecutionLimit {
                    account_id: execution.account_id,
                    running,
                    limit,
                });
            }
            LeaseOutcome::Terminal(status) => {
                return Err(EngineError::ExecutionTerminal {
                    execution_id,
                    status,
                })
            }
        };

        match self.load_claimed(&lease).await {
            Ok(claim) => Ok(claim),
            Err(e) => {
                self.release(&lease).await;
                Err(e)
            }
        }
    }

    async fn load_claimed(&self, lease: &Lease) -> Result<ClaimedExecution, EngineError> {
        let mut execution = self.store.get_execution(lease.execution_id).await?;

        let active = self
            .definitions
            .is_workflow_active(execution.workflow_id)
            .await?;
        let contact = self.contacts.get_snapshot(execution.contact_id).await?;

        let contact = match (active, contact) {
            (false, _) => Err(EngineError::WorkflowNotActive(execution.workflow_id)),
            (true, None) => Err(EngineError::ContactNotFound(execution.contact_id)),
            (true, Some(c)) if c.opted_out => Err(EngineError::ContactOptedOut(execution.contact_id)),
            (true, Some(c)) => Ok(c),
        };

        match contact {
            Ok(contact) => Ok(ClaimedExecution {
                lease: lease.clone(),
                execution,
                contact,
            }),
            Err(err) => {
                warn!(execution_id = %execution.id, error = %err, "precondition failed, cancelling execution");
                self.finish_execution(
                    lease,
                    &mut execution,
                    ExecutionStatus::Cancelled,
                    ExitReason::Cancelled,
                    Some(err.to_string()),
                    Utc::now(),
                )
                .await?;
                Err(err)
            }
        }
    }

    pub async fn release(&self, lease: &Lease) {
        if let Err(e) = self.store.release_lease(lease).await {
            warn!(execution_id = %lease.execution_id, error = %e, "failed to release lease");
        }
    }

    // =========================================================================
    // Driving
    // =========================================================================

    /// Advance a claimed execution until it suspends, finishes or uses up its
    /// step budget, then release the lease
    #[instrument(skip(self, claim, event), fields(execution_id = %claim.execution.id))]
    pub async fn drive(
        &self,
        mut claim: ClaimedExecution,
        event: Option<&InboundEvent>,
    ) -> Result<ExecutionOutcome, EngineError> {
        let result = self.drive_steps(&mut claim, event).await;
        self.release(&claim.lease).await;

        match result {
            // cancelled underneath us; the current unit of work is done
            Err(EngineError::Store(StoreError::TerminalState { status, .. })) => {
                info!(execution_id = %claim.execution.id, %status, "execution finished elsewhere, stopping");
                Ok(ExecutionOutcome::Stopped { status })
            }
            other => other,
        }
    }

    async fn drive_steps(
        &self,
        claim: &mut ClaimedExecution,
        event: Option<&InboundEvent>,
    ) -> Result<ExecutionOutcome, EngineError> {
        for step in 0..self.config.max_steps_per_drive.max(1) {
            let trigger = if step == 0 { event } else { None };
            let outcome = self.advance(claim, trigger).await?;
            if outcome != ExecutionOutcome::Advanced {
                return Ok(outcome);
            }
            claim.lease = self
                .store
                .renew_lease(&claim.lease, self.config.lease_ttl, Utc::now())
                .await?;
        }
        debug!(execution_id = %claim.execution.id, "step budget used, yielding");
        Ok(ExecutionOutcome::Yielded)
    }

    /// Take one step
    pub async fn advance(
        &self,
        claim: &mut ClaimedExecution,
        event: Option<&InboundEvent>,
    ) -> Result<ExecutionOutcome, EngineError> {
        let now = Utc::now();
        if claim.execution.is_terminal() {
            return Ok(ExecutionOutcome::Stopped {
                status: claim.execution.status,
            });
        }

        let Some(mut definition) = self.load_definition(claim, now).await? else {
            return Ok(ExecutionOutcome::Failed {
                error: claim.execution.error_message.clone().unwrap_or_default(),
            });
        };

        if claim.execution.status != ExecutionStatus::Waiting {
            if let Some(target) = crate::migration::migrate_at_boundary(
                &self.store,
                &self.definitions,
                &claim.lease,
                &mut claim.execution,
                &definition,
            )
            .await?
            {
                definition = target;
            }
        }

        if let Some(outcome) = self.check_timeout(claim, &definition, now).await? {
            return Ok(outcome);
        }

        if let Some(outcome) = self.check_goals(claim, &definition, event, now).await? {
            return Ok(outcome);
        }

        match claim.execution.status {
            ExecutionStatus::Waiting => {
                let wait = self.store.open_wait_for_execution(claim.execution.id).await?;
                return Ok(match wait {
                    Some(wait) => ExecutionOutcome::Waiting { wait_id: wait.id },
                    None => ExecutionOutcome::Stopped {
                        status: ExecutionStatus::Waiting,
                    },
                });
            }
            ExecutionStatus::Queued => {
                transition(&mut claim.execution, ExecutionStatus::Active, now)?;
                self.save(claim).await?;
                info!(execution_id = %claim.execution.id, "execution started");
            }
            _ => {}
        }

        let Some(node_id) = claim.execution.current_node_id.clone() else {
            return self.complete(claim, now).await;
        };
        let Some(node) = definition.node(&node_id) else {
            let err = DefinitionError::UnknownNode(node_id);
            return self.fail(claim, err.to_string(), ExitReason::Failed, now).await;
        };

        debug!(
            execution_id = %claim.execution.id,
            node_id = %node.id,
            node_type = node.kind.node_type(),
            "stepping"
        );

        match &node.kind {
            NodeKind::Action(action) => self.run_action(claim, &definition, node, action).await,
            NodeKind::Condition(condition) => self.run_condition(claim, node, condition, now).await,
            NodeKind::Wait(wait) => self.enter_wait(claim, node, wait, now).await,
            NodeKind::Exit => self.complete(claim, now).await,
        }
    }

    /// Definition the execution is pinned to; a broken snapshot fails the
    /// execution and yields `None`
    async fn load_definition(
        &self,
        claim: &mut ClaimedExecution,
        now: DateTime<Utc>,
    ) -> Result<Option<Arc<WorkflowDefinition>>, EngineError> {
        let execution = &claim.execution;
        match self
            .definitions
            .get(execution.workflow_id, execution.workflow_version)
            .await
        {
            Ok(definition) => Ok(Some(definition)),
            Err(e) if e.is_transient() => Err(e.into()),
            Err(e) => {
                error!(execution_id = %execution.id, error = %e, "definition snapshot unusable");
                self.fail(claim, e.to_string(), ExitReason::Failed, now).await?;
                Ok(None)
            }
        }
    }

    async fn check_timeout(
        &self,
        claim: &mut ClaimedExecution,
        definition: &WorkflowDefinition,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionOutcome>, EngineError> {
        let mut timeouts = self.config.timeouts.clone();
        if let Some(secs) = definition.settings.max_execution_seconds {
            timeouts.max_execution_duration = Duration::from_secs(secs);
        }

        match timeouts.check_execution(claim.execution.started_at, now) {
            Some(TimeoutError::Execution { elapsed, .. }) => {
                let err = EngineError::ExecutionTimeout {
                    execution_id: claim.execution.id,
                    elapsed,
                };
                warn!(execution_id = %claim.execution.id, ?elapsed, "execution timed out");
                Ok(Some(self.fail(claim, err.to_string(), ExitReason::Timeout, now).await?))
            }
            _ => Ok(None),
        }
    }

    // =========================================================================
    // Goals
    // =========================================================================

    /// Check goals against an event for a claimed execution without stepping it
    pub async fn apply_event_goals(
        &self,
        claim: &mut ClaimedExecution,
        event: &InboundEvent,
    ) -> Result<Option<ExecutionOutcome>, EngineError> {
        let execution = &claim.execution;
        if execution.is_terminal() {
            return Ok(None);
        }
        let definition = self
            .definitions
            .get(execution.workflow_id, execution.workflow_version)
            .await?;
        self.check_goals(claim, &definition, Some(event), Utc::now()).await
    }

    /// Complete the execution if an unachieved goal is met
    ///
    /// Event-matched goals are tried before state-satisfied ones; the first
    /// goal whose achievement insert wins short-circuits the graph.
    async fn check_goals(
        &self,
        claim: &mut ClaimedExecution,
        definition: &WorkflowDefinition,
        event: Option<&InboundEvent>,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionOutcome>, EngineError> {
        if definition.goals.is_empty() {
            return Ok(None);
        }

        let mut candidates: Vec<(&GoalConfig, Option<&InboundEvent>)> = Vec::new();
        if let Some(event) = event {
            let signal = GoalSignal::Event {
                event_type: &event.event_type,
                data: &event.data,
            };
            candidates.extend(goal::detect(&definition.goals, signal).into_iter().map(|g| (g, Some(event))));
        }
        for g in goal::detect(&definition.goals, GoalSignal::State(&claim.contact)) {
            if !candidates.iter().any(|(c, _)| c.id == g.id) {
                candidates.push((g, None));
            }
        }

        let execution_id = claim.execution.id;
        let contact_id = claim.execution.contact_id;
        for (goal, event) in candidates {
            if self.store.has_achievement(contact_id, goal.id).await? {
                continue;
            }
            let mut achievement = GoalAchievement::new(
                goal,
                claim.execution.account_id,
                contact_id,
                claim.execution.workflow_id,
                execution_id,
            );
            if let Some(event) = event {
                achievement = achievement.with_event(event.event_type.clone(), event.data.clone());
            }

            // A queued execution starts and exits in the same write
            let mut finished = claim.execution.clone();
            if finished.status == ExecutionStatus::Queued {
                transition(&mut finished, ExecutionStatus::Active, now)?;
            }
            finished
                .finish(ExecutionStatus::Completed, ExitReason::GoalAchieved, None, now)
                .map_err(|e| StoreError::InvalidTransition {
                    execution_id,
                    from: e.from,
                    to: e.to,
                })?;
            if !self.store.record_goal_exit(&claim.lease, &finished, &achievement).await? {
                continue;
            }
            claim.execution = finished;

            info!(
                %execution_id,
                goal_id = %goal.id,
                goal_type = goal.goal_type.as_str(),
                "goal achieved"
            );
            self.close_out(&claim.execution, now).await?;
            return Ok(Some(ExecutionOutcome::Completed {
                exit_reason: ExitReason::GoalAchieved,
            }));
        }
        Ok(None)
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    async fn run_action(
        &self,
        claim: &mut ClaimedExecution,
        definition: &WorkflowDefinition,
        node: &Node,
        action_node: &ActionNode,
    ) -> Result<ExecutionOutcome, EngineError> {
        let now = Utc::now();
        let mut action = self
            .open_action(claim.execution.id, node, action_node.action.action_type(), now)
            .await?;

        if !action_node.enabled {
            action.skip("action disabled", now);
            self.store.update_action_execution(&action).await?;
            return self.move_to(claim, node.next.clone(), now).await;
        }

        let attempt = action.retry_count + 1;
        let execution_data = json!({
            "action_type": action_node.action.action_type(),
            "config": action_node.action.config_json(),
            "contact": claim.contact.to_document(),
            "results": claim.execution.results(),
            "metadata": claim.execution.metadata,
        });
        action.start(execution_data.clone(), now);
        self.store.update_action_execution(&action).await?;

        let context = DispatchContext {
            execution_id: claim.execution.id,
            action_execution_id: action.id,
            workflow_id: claim.execution.workflow_id,
            account_id: claim.execution.account_id,
            node_id: node.id.clone(),
            contact: claim.contact.clone(),
            execution_data,
            attempt,
        };
        let result = match self
            .config
            .timeouts
            .run_dispatch(self.dispatcher.dispatch(&action_node.action, &context))
            .await
        {
            Ok(result) => result,
            Err(timeout) => Err(DispatchError::retryable(timeout.to_string()).with_code("DISPATCH_TIMEOUT")),
        };
        let now = Utc::now();

        match result {
            Ok(result) => {
                match result.status {
                    DispatchStatus::Completed => action.complete(result.result_data.clone(), now),
                    DispatchStatus::Skipped => {
                        let reason = result
                            .result_data
                            .get("reason")
                            .and_then(|r| r.as_str())
                            .unwrap_or("skipped by handler")
                            .to_string();
                        action.skip(reason, now);
                    }
                }
                self.store.update_action_execution(&action).await?;
                info!(
                    execution_id = %claim.execution.id,
                    node_id = %node.id,
                    action_type = %action.action_type,
                    status = %action.status,
                    attempt,
                    "action finished"
                );

                claim.execution.record_result(&node.id, result.result_data);
                claim.execution.retry_count = 0;
                self.refresh_contact(claim).await;
                self.move_to(claim, node.next.clone(), now).await
            }
            Err(err) => {
                let policy = retry_policy_for(&self.config.retry_policy, definition, action_node);
                action.retry_count = attempt;

                if err.retryable
                    && policy.should_retry(err.error_code.as_deref())
                    && policy.has_attempts_remaining(attempt)
                {
                    let delay = policy.delay_for_retry(attempt);
                    let at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    action.schedule_retry(err.to_string(), at);
                    self.store.update_action_execution(&action).await?;

                    claim.execution.retry_count = attempt;
                    claim.execution.next_run_at = Some(at);
                    claim.execution.updated_at = now;
                    self.save(claim).await?;

                    warn!(
                        execution_id = %claim.execution.id,
                        node_id = %node.id,
                        attempt,
                        retry_at = %at,
                        error = %err,
                        "action failed, retry scheduled"
                    );
                    return Ok(ExecutionOutcome::RetryScheduled {
                        attempt: attempt + 1,
                        at,
                    });
                }

                action.fail(err.to_string(), now);
                self.store.update_action_execution(&action).await?;

                let failure = EngineError::RetryExhausted {
                    execution_id: claim.execution.id,
                    node_id: node.id.clone(),
                    attempts: attempt,
                    message: err.to_string(),
                };
                error!(execution_id = %claim.execution.id, error = %failure, "action failed permanently");
                self.fail(claim, failure.to_string(), ExitReason::Failed, now).await
            }
        }
    }

    /// The action execution for this node visit, created if missing
    ///
    /// An open record left on another node (the graph moved on or was
    /// remapped) is closed as skipped first.
    async fn open_action(
        &self,
        execution_id: Uuid,
        node: &Node,
        action_type: &str,
        now: DateTime<Utc>,
    ) -> Result<ActionExecution, EngineError> {
        if let Some(mut open) = self.store.open_action_execution(execution_id).await? {
            if open.node_id == node.id && open.status != ActionStatus::Waiting {
                return Ok(open);
            }
            open.skip(format!("superseded at node {}", node.id), now);
            self.store.update_action_execution(&open).await?;
        }
        let action = ActionExecution::new(execution_id, node.id.clone(), action_type);
        self.store.insert_action_execution(&action).await?;
        Ok(action)
    }

    async fn run_condition(
        &self,
        claim: &mut ClaimedExecution,
        node: &Node,
        condition: &ConditionNode,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, EngineError> {
        let ctx = EvaluationContext::new(&claim.contact, now);
        let Some(selection) = condition::select_branch(&node.id, condition, &ctx) else {
            let reason = format!("condition node '{}' selected no branch", node.id);
            return self.fail(claim, reason, ExitReason::Failed, now).await;
        };

        let log = ConditionLog {
            id: Uuid::now_v7(),
            workflow_execution_id: claim.execution.id,
            node_id: node.id.clone(),
            condition_type: condition.condition_type().to_string(),
            branch_id: selection.branch_id.clone(),
            matched: selection.matched,
            details: selection.details,
            duration_micros: selection.duration_micros,
            evaluated_at: now,
        };
        self.store.insert_condition_log(&log).await?;

        debug!(
            execution_id = %claim.execution.id,
            node_id = %node.id,
            branch_id = %selection.branch_id,
            matched = selection.matched,
            "branch selected"
        );
        self.move_to(claim, selection.next_node_id, now).await
    }

    async fn enter_wait(
        &self,
        claim: &mut ClaimedExecution,
        node: &Node,
        wait_node: &WaitNode,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, EngineError> {
        let wait = self
            .waits
            .enter(&claim.execution, &node.id, wait_node, &claim.contact, now)
            .await?;

        let open = self.store.open_action_execution(claim.execution.id).await?;
        match open {
            Some(open) if open.node_id == node.id && open.status == ActionStatus::Waiting => {}
            other => {
                if let Some(mut stale) = other {
                    stale.skip(format!("superseded at node {}", node.id), now);
                    self.store.update_action_execution(&stale).await?;
                }
                let mut record = ActionExecution::new(claim.execution.id, node.id.clone(), "wait");
                record.status = ActionStatus::Waiting;
                record.started_at = Some(now);
                record.execution_data = json!({
                    "wait_execution_id": wait.id,
                    "wait_type": wait.wait_type,
                    "scheduled_at": wait.scheduled_at,
                    "event_type": wait.event_type,
                });
                self.store.insert_action_execution(&record).await?;
            }
        }

        transition(&mut claim.execution, ExecutionStatus::Waiting, now)?;
        claim.execution.next_run_at = None;
        self.save(claim).await?;
        Ok(ExecutionOutcome::Waiting { wait_id: wait.id })
    }

    // =========================================================================
    // Resumption
    // =========================================================================

    /// Move a claimed execution past a due wait
    ///
    /// The execution is saved before the wait is closed, so a crash in
    /// between leaves a due wait whose execution has already moved on; a
    /// later attempt only closes the wait. Returns `false` when there was
    /// nothing to resume.
    pub async fn resume(
        &self,
        claim: &mut ClaimedExecution,
        wait: &WaitExecution,
    ) -> Result<bool, EngineError> {
        let now = Utc::now();
        let wait = self.store.get_wait(wait.id).await?;
        if wait.status != WaitStatus::Scheduled {
            debug!(wait_id = %wait.id, status = %wait.status, "wait no longer due");
            return Ok(false);
        }

        let execution = &claim.execution;
        let at_wait = match execution.status {
            ExecutionStatus::Waiting => true,
            // crashed between creating the wait and saving `waiting`
            ExecutionStatus::Active => execution.current_node_id.as_deref() == Some(wait.step_id.as_str()),
            _ => false,
        };
        if !at_wait {
            self.waits.complete(&wait, now).await?;
            debug!(wait_id = %wait.id, "execution already past wait, closed it");
            return Ok(false);
        }

        let definition = self
            .definitions
            .get(execution.workflow_id, execution.workflow_version)
            .await?;
        // migration may have remapped the pointer since the wait was created
        let node_id = execution
            .current_node_id
            .clone()
            .unwrap_or_else(|| wait.step_id.clone());
        let Some(node) = definition.node(&node_id) else {
            let err = DefinitionError::UnknownNode(node_id);
            self.fail(claim, err.to_string(), ExitReason::Failed, now).await?;
            self.waits.complete(&wait, now).await?;
            return Ok(false);
        };

        let resumer = wait.resumer();
        let next = match (&node.kind, resumer) {
            (NodeKind::Wait(w), ResumedBy::Timeout) => w.timeout_next_node_id.clone().or_else(|| node.next.clone()),
            _ => node.next.clone(),
        };
        let resume_result = json!({
            "resumed_by": resumer,
            "event": wait.resume_event,
        });

        if let Some(mut record) = self.store.open_action_execution(claim.execution.id).await? {
            if record.status == ActionStatus::Waiting {
                record.complete(resume_result.clone(), now);
                self.store.update_action_execution(&record).await?;
            }
        }

        if claim.execution.status == ExecutionStatus::Waiting {
            transition(&mut claim.execution, ExecutionStatus::Active, now)?;
        }
        claim.execution.record_result(&node.id, resume_result);
        claim.execution.advance_to(next, now);
        claim.execution.next_run_at = Some(now);
        self.save(claim).await?;

        self.waits.complete(&wait, now).await?;
        info!(
            execution_id = %claim.execution.id,
            wait_id = %wait.id,
            resumed_by = %resumer,
            "execution resumed"
        );
        Ok(true)
    }

    /// Make a claimed execution runnable now, cutting a retry backoff short
    pub async fn expedite(&self, mut claim: ClaimedExecution) -> Result<WorkflowExecution, EngineError> {
        let now = Utc::now();
        claim.execution.next_run_at = Some(now);
        claim.execution.updated_at = now;
        let saved = self.save(&claim).await;
        self.release(&claim.lease).await;
        saved?;

        info!(execution_id = %claim.execution.id, "execution expedited");
        Ok(claim.execution)
    }

    // =========================================================================
    // Persistence helpers
    // =========================================================================

    async fn save(&self, claim: &ClaimedExecution) -> Result<(), EngineError> {
        self.store
            .save_execution(&claim.lease, &claim.execution)
            .await
            .map_err(EngineError::from)
    }

    async fn move_to(
        &self,
        claim: &mut ClaimedExecution,
        next: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, EngineError> {
        claim.execution.advance_to(next, now);
        claim.execution.next_run_at = Some(now);
        self.save(claim).await?;
        Ok(ExecutionOutcome::Advanced)
    }

    async fn refresh_contact(&self, claim: &mut ClaimedExecution) {
        match self.contacts.get_snapshot(claim.execution.contact_id).await {
            Ok(Some(contact)) => claim.contact = contact,
            Ok(None) => {}
            Err(e) => debug!(error = %e, "contact refresh failed, keeping previous snapshot"),
        }
    }

    async fn complete(
        &self,
        claim: &mut ClaimedExecution,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, EngineError> {
        self.finish(claim, ExecutionStatus::Completed, ExitReason::EndOfWorkflow, None, now).await
    }

    async fn fail(
        &self,
        claim: &mut ClaimedExecution,
        error: String,
        exit_reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, EngineError> {
        self.finish(claim, ExecutionStatus::Failed, exit_reason, Some(error), now).await
    }

    async fn finish(
        &self,
        claim: &mut ClaimedExecution,
        status: ExecutionStatus,
        exit_reason: ExitReason,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome, EngineError> {
        let lease = claim.lease.clone();
        self.finish_execution(&lease, &mut claim.execution, status, exit_reason, error.clone(), now)
            .await?;

        Ok(match status {
            ExecutionStatus::Failed => ExecutionOutcome::Failed {
                error: error.unwrap_or_default(),
            },
            ExecutionStatus::Cancelled => ExecutionOutcome::Cancelled {
                reason: error.unwrap_or_default(),
            },
            _ => ExecutionOutcome::Completed { exit_reason },
        })
    }

    /// Move to a terminal status and close everything still open
    async fn finish_execution(
        &self,
        lease: &Lease,
        execution: &mut WorkflowExecution,
        status: ExecutionStatus,
        exit_reason: ExitReason,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        execution
            .finish(status, exit_reason, error, now)
            .map_err(|e| StoreError::InvalidTransition {
                execution_id: execution.id,
                from: e.from,
                to: e.to,
            })?;
        self.store.save_execution(lease, execution).await?;
        self.close_out(execution, now).await
    }

    /// Release what a just-finished execution still holds
    async fn close_out(&self, execution: &WorkflowExecution, now: DateTime<Utc>) -> Result<(), EngineError> {
        let status = execution.status;
        close_open_work(&self.store, &self.waits, execution.id, status, now).await?;
        self.store
            .adjust_active_executions(execution.workflow_id, execution.workflow_version, -1)
            .await?;

        info!(
            execution_id = %execution.id,
            %status,
            exit_reason = ?execution.exit_reason,
            "execution finished"
        );
        Ok(())
    }
}

/// Cancel the open wait and skip the open action of a finished execution
pub(crate) async fn close_open_work(
    store: &Arc<dyn EngineStore>,
    waits: &WaitScheduler,
    execution_id: Uuid,
    status: ExecutionStatus,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    waits.cancel_for_execution(execution_id, now).await?;
    if let Some(mut action) = store.open_action_execution(execution_id).await? {
        action.skip(format!("execution {}", status), now);
        store.update_action_execution(&action).await?;
    }
    Ok(())
}

fn transition(
    execution: &mut WorkflowExecution,
    to: ExecutionStatus,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    execution.transition(to, now).map_err(|e| {
        EngineError::Store(StoreError::InvalidTransition {
            execution_id: execution.id,
            from: e.from,
            to: e.to,
        })
    })
}

/// Retry policy for one action: node override, then workflow, then engine
fn retry_policy_for(
    default: &RetryPolicy,
    definition: &WorkflowDefinition,
    action: &ActionNode,
) -> RetryPolicy {
    match action.max_retries.or(definition.settings.max_retries) {
        Some(max_retries) => default.clone().with_max_retries(max_retries),
        None => default.clone(),
    }
}
