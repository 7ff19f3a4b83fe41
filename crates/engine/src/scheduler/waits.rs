//! Wait scheduling and event-based resumption
//!
//! A wait node suspends an execution. Time-based waits are stored as
//! `scheduled` with their resume time. Event waits are stored as `waiting`
//! with an active listener; the listener leaves `active` exactly once, and
//! whoever wins that compare-and-set moves the wait to `scheduled` so the
//! resume itself always goes through the due-wait path under the execution
//! lease.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::contact::ContactSnapshot;
use crate::criteria;
use crate::definition::{WaitConfig, WaitNode};
use crate::events::InboundEvent;
use crate::model::{
    EventListener, ListenerStatus, ResumedBy, WaitExecution, WaitStatus, WorkflowExecution,
};
use crate::persistence::{EngineStore, ListenerClose, StoreError, WaitInsert, WaitTransition};

/// Creates, matches, expires and closes waits
pub struct WaitScheduler {
    store: Arc<dyn EngineStore>,
}

impl WaitScheduler {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    /// Suspend an execution at a wait node
    ///
    /// Idempotent per (execution, node): re-entering after a crash returns
    /// the wait created the first time.
    pub async fn enter(
        &self,
        execution: &WorkflowExecution,
        node_id: &str,
        wait_node: &WaitNode,
        contact: &ContactSnapshot,
        now: DateTime<Utc>,
    ) -> Result<WaitExecution, StoreError> {
        let config = &wait_node.wait;
        let mut wait = WaitExecution::new(
            execution.id,
            node_id,
            execution.account_id,
            execution.contact_id,
            config.wait_type(),
        );
        let resume_at = config.resume_at(now, contact.utc_offset_minutes);

        let criteria = match config {
            WaitConfig::ForEvent {
                event_type,
                match_criteria,
                correlation_key,
                ..
            } => {
                wait.status = WaitStatus::Waiting;
                wait.event_type = Some(event_type.clone());
                wait.event_correlation_id = correlation_key
                    .as_deref()
                    .and_then(|key| execution.metadata_str(key));
                wait.event_timeout_at = resume_at;
                Some(match_criteria.clone())
            }
            _ => {
                wait.status = WaitStatus::Scheduled;
                wait.scheduled_at = Some(resume_at.unwrap_or(now));
                None
            }
        };

        let wait = match self.store.insert_wait(&wait).await? {
            WaitInsert::Inserted => wait,
            WaitInsert::Existing(existing) => {
                debug!(wait_id = %existing.id, execution_id = %execution.id, "wait already exists");
                existing
            }
        };

        if let Some(criteria) = criteria {
            if wait.status == WaitStatus::Waiting
                && self.store.find_listener_for_wait(wait.id).await?.is_none()
            {
                let listener = EventListener::for_wait(&wait, criteria);
                self.store.insert_listener(&listener).await?;
            }
        }

        info!(
            execution_id = %execution.id,
            wait_id = %wait.id,
            wait_type = %wait.wait_type,
            scheduled_at = ?wait.scheduled_at,
            event_type = ?wait.event_type,
            "execution entered wait"
        );
        Ok(wait)
    }

    /// Match an inbound event against active listeners
    ///
    /// Returns the waits this event made due. A listener that expired before
    /// the event is processed as a timeout instead.
    pub async fn match_event(
        &self,
        event: &InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<Vec<WaitExecution>, StoreError> {
        let listeners = self
            .store
            .find_active_listeners(&event.event_type, event.contact_id)
            .await?;
        if listeners.is_empty() {
            return Ok(Vec::new());
        }

        let document = event.to_document();
        let payload = serde_json::to_value(event)?;
        let mut resumed = Vec::new();

        for listener in listeners {
            if listener.account_id != event.account_id {
                continue;
            }
            if listener.is_expired_at(now) {
                debug!(listener_id = %listener.id, "event arrived after listener expiry");
                if let Some(wait) = self.expire_listener(&listener, now).await? {
                    resumed.push(wait);
                }
                continue;
            }
            if let Some(expected) = &listener.correlation_id {
                if event.correlation_id.as_ref() != Some(expected) {
                    continue;
                }
            }
            if !criteria::all_match(&listener.match_criteria, &document) {
                continue;
            }

            let mut transition = WaitTransition::new(
                listener.wait_execution_id,
                &[WaitStatus::Waiting],
                WaitStatus::Scheduled,
                now,
            );
            transition.scheduled_at = Some(now);
            transition.pending_resume = Some(ResumedBy::Event);
            transition.resume_event = Some(payload.clone());

            let closed = self
                .store
                .close_listener_with_wait(
                    listener.id,
                    ListenerStatus::Matched,
                    Some(payload.clone()),
                    transition,
                )
                .await?;
            match closed {
                ListenerClose::AlreadyClosed => {
                    debug!(listener_id = %listener.id, "listener already closed");
                }
                ListenerClose::Closed(Some(wait)) => {
                    info!(
                        wait_id = %wait.id,
                        execution_id = %wait.workflow_execution_id,
                        event_type = %event.event_type,
                        "event matched wait"
                    );
                    resumed.push(wait);
                }
                ListenerClose::Closed(None) => {
                    warn!(wait_id = %listener.wait_execution_id, "matched listener's wait is no longer waiting")
                }
            }
        }

        Ok(resumed)
    }

    /// Expire listeners whose timeout has passed, making their waits due
    pub async fn expire_listeners(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WaitExecution>, StoreError> {
        let mut due = Vec::new();
        for listener in self.store.list_expired_listeners(now, limit).await? {
            if let Some(wait) = self.expire_listener(&listener, now).await? {
                due.push(wait);
            }
        }
        Ok(due)
    }

    async fn expire_listener(
        &self,
        listener: &EventListener,
        now: DateTime<Utc>,
    ) -> Result<Option<WaitExecution>, StoreError> {
        let mut transition = WaitTransition::new(
            listener.wait_execution_id,
            &[WaitStatus::Waiting],
            WaitStatus::Scheduled,
            now,
        );
        transition.scheduled_at = Some(now);
        transition.pending_resume = Some(ResumedBy::Timeout);

        let wait = match self
            .store
            .close_listener_with_wait(listener.id, ListenerStatus::Expired, None, transition)
            .await?
        {
            ListenerClose::AlreadyClosed => return Ok(None),
            ListenerClose::Closed(wait) => wait,
        };
        if let Some(wait) = &wait {
            info!(
                wait_id = %wait.id,
                execution_id = %wait.workflow_execution_id,
                "event wait timed out"
            );
        }
        Ok(wait)
    }

    /// Waits due for resumption
    pub async fn due_waits(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WaitExecution>, StoreError> {
        self.store.list_due_waits(now, limit).await
    }

    /// Close a due wait after its execution moved past it
    ///
    /// `None` when another resumer already closed it.
    pub async fn complete(
        &self,
        wait: &WaitExecution,
        now: DateTime<Utc>,
    ) -> Result<Option<WaitExecution>, StoreError> {
        let resumer = wait.resumer();
        let to = if resumer == ResumedBy::Timeout {
            WaitStatus::Timeout
        } else {
            WaitStatus::Resumed
        };
        let mut transition = WaitTransition::new(wait.id, &[WaitStatus::Scheduled], to, now);
        transition.resumed_by = Some(resumer);
        self.store.transition_wait(transition).await
    }

    /// Cancel the open wait of an execution and expire its listener
    pub async fn cancel_for_execution(
        &self,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<WaitExecution>, StoreError> {
        let Some(wait) = self.store.open_wait_for_execution(execution_id).await? else {
            return Ok(None);
        };

        let mut transition =
            WaitTransition::new(wait.id, &WaitStatus::OPEN, WaitStatus::Cancelled, now);
        transition.resumed_by = Some(ResumedBy::Cancelled);

        let listener = self
            .store
            .find_listener_for_wait(wait.id)
            .await?
            .filter(|l| l.status == ListenerStatus::Active);
        let cancelled = match listener {
            Some(listener) => match self
                .store
                .close_listener_with_wait(listener.id, ListenerStatus::Expired, None, transition.clone())
                .await?
            {
                ListenerClose::Closed(wait) => wait,
                // an event or timeout closed it first; cancel the wait anyway
                ListenerClose::AlreadyClosed => self.store.transition_wait(transition).await?,
            },
            None => self.store.transition_wait(transition).await?,
        };
        if cancelled.is_some() {
            debug!(wait_id = %wait.id, %execution_id, "wait cancelled");
        }
        Ok(cancelled)
    }

    /// Make an open wait due now on behalf of an operator
    ///
    /// `None` when the wait is no longer open or an event or timeout got to
    /// it first.
    pub async fn manual_resume(
        &self,
        wait_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<WaitExecution>, StoreError> {
        let wait = self.store.get_wait(wait_id).await?;

        let from: &[WaitStatus] = match wait.status {
            WaitStatus::Waiting => &[WaitStatus::Waiting],
            WaitStatus::Scheduled if wait.pending_resume.is_none() => &[WaitStatus::Scheduled],
            _ => return Ok(None),
        };
        let mut transition = WaitTransition::new(wait.id, from, WaitStatus::Scheduled, now);
        transition.scheduled_at = Some(now);
        transition.pending_resume = Some(ResumedBy::Manual);

        // An event wait is only resumed through its listener
        let listener = match wait.status {
            WaitStatus::Waiting => Some(
                self.store
                    .find_listener_for_wait(wait.id)
                    .await?
                    .ok_or(StoreError::ListenerNotFound(wait.id))?,
            ),
            _ => None,
        };
        let resumed = match listener {
            Some(listener) => match self
                .store
                .close_listener_with_wait(listener.id, ListenerStatus::Expired, None, transition)
                .await?
            {
                ListenerClose::AlreadyClosed => return Ok(None),
                ListenerClose::Closed(wait) => wait,
            },
            None => self.store.transition_wait(transition).await?,
        };
        if resumed.is_some() {
            info!(%wait_id, "wait resumed manually");
        }
        Ok(resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::{FieldCriterion, Operator};
    use crate::definition::WorkflowDefinition;
    use crate::model::{EnrollmentSource, WaitType};
    use crate::persistence::{EventListenerRepository, InMemoryEngineStore, WaitRepository};
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryEngineStore>,
        scheduler: WaitScheduler,
        execution: WorkflowExecution,
        contact: ContactSnapshot,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryEngineStore::new());
        let def = WorkflowDefinition::new(Uuid::now_v7(), Uuid::now_v7(), 1);
        let execution = WorkflowExecution::new(&def, Uuid::now_v7(), EnrollmentSource::Api)
            .with_metadata(json!({"order_id": "o-42"}));
        let contact = ContactSnapshot::new(execution.contact_id, execution.account_id);
        Fixture {
            scheduler: WaitScheduler::new(store.clone()),
            store,
            execution,
            contact,
        }
    }

    fn event_wait(timeout_seconds: Option<u64>) -> WaitNode {
        WaitNode {
            wait: WaitConfig::ForEvent {
                event_type: "email_opened".into(),
                match_criteria: vec![FieldCriterion::new("campaign_id", Operator::Equals, "spring")],
                timeout_seconds,
                correlation_key: None,
            },
            timeout_next_node_id: None,
        }
    }

    fn opened(f: &Fixture, campaign: &str) -> InboundEvent {
        InboundEvent::new(
            "email_opened",
            f.execution.account_id,
            f.execution.contact_id,
            json!({"campaign_id": campaign}),
        )
    }

    #[tokio::test]
    async fn test_time_wait_is_scheduled() {
        let f = fixture();
        let node = WaitNode {
            wait: WaitConfig::FixedTime {
                duration_seconds: 60,
            },
            timeout_next_node_id: None,
        };
        let now = Utc::now();

        let wait = f.scheduler.enter(&f.execution, "pause", &node, &f.contact, now).await.unwrap();
        assert_eq!(wait.status, WaitStatus::Scheduled);
        assert_eq!(wait.wait_type, WaitType::FixedTime);
        assert_eq!(wait.scheduled_at, Some(now + chrono::Duration::seconds(60)));

        assert!(f.scheduler.due_waits(now, 10).await.unwrap().is_empty());
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(f.scheduler.due_waits(later, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_enter_is_idempotent() {
        let f = fixture();
        let node = event_wait(None);
        let now = Utc::now();

        let first = f.scheduler.enter(&f.execution, "w", &node, &f.contact, now).await.unwrap();
        let second = f.scheduler.enter(&f.execution, "w", &node, &f.contact, now).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(f.store.find_listener_for_wait(first.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_matching_event_schedules_wait_once() {
        let f = fixture();
        let now = Utc::now();
        let wait = f.scheduler.enter(&f.execution, "w", &event_wait(Some(3600)), &f.contact, now).await.unwrap();

        assert!(f.scheduler.match_event(&opened(&f, "autumn"), now).await.unwrap().is_empty());

        let matched = f.scheduler.match_event(&opened(&f, "spring"), now).await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, wait.id);
        assert_eq!(matched[0].status, WaitStatus::Scheduled);
        assert_eq!(matched[0].resumer(), ResumedBy::Event);

        // the listener is closed; a second event finds nothing
        assert!(f.scheduler.match_event(&opened(&f, "spring"), now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_correlation_id_must_match() {
        let f = fixture();
        let node = WaitNode {
            wait: WaitConfig::ForEvent {
                event_type: "purchase_completed".into(),
                match_criteria: vec![],
                timeout_seconds: None,
                correlation_key: Some("order_id".into()),
            },
            timeout_next_node_id: None,
        };
        let now = Utc::now();
        let wait = f.scheduler.enter(&f.execution, "w", &node, &f.contact, now).await.unwrap();
        assert_eq!(wait.event_correlation_id.as_deref(), Some("o-42"));

        let purchase = |id: &str| {
            InboundEvent::new("purchase_completed", f.execution.account_id, f.execution.contact_id, json!({}))
                .with_correlation_id(id)
        };
        assert!(f.scheduler.match_event(&purchase("o-1"), now).await.unwrap().is_empty());
        assert_eq!(f.scheduler.match_event(&purchase("o-42"), now).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expiry_and_late_event() {
        let f = fixture();
        let now = Utc::now();
        let wait = f.scheduler.enter(&f.execution, "w", &event_wait(Some(60)), &f.contact, now).await.unwrap();

        let later = now + chrono::Duration::seconds(120);
        let expired = f.scheduler.expire_listeners(later, 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].resumer(), ResumedBy::Timeout);

        // an event after the timeout resumes nothing
        assert!(f.scheduler.match_event(&opened(&f, "spring"), later).await.unwrap().is_empty());

        let closed = f.scheduler.complete(&expired[0], later).await.unwrap().unwrap();
        assert_eq!(closed.status, WaitStatus::Timeout);
        assert_eq!(closed.resumed_by, Some(ResumedBy::Timeout));
        assert!(f.scheduler.complete(&expired[0], later).await.unwrap().is_none());
        assert_eq!(f.store.get_wait(wait.id).await.unwrap().status, WaitStatus::Timeout);
    }

    #[tokio::test]
    async fn test_event_and_timeout_race_has_one_winner() {
        let f = fixture();
        let now = Utc::now();
        f.scheduler.enter(&f.execution, "w", &event_wait(Some(60)), &f.contact, now).await.unwrap();
        let at_timeout = now + chrono::Duration::seconds(60);

        let listeners = f.store.find_active_listeners("email_opened", f.execution.contact_id).await.unwrap();
        let (by_event, by_timeout) = tokio::join!(
            f.store.close_listener(listeners[0].id, ListenerStatus::Matched, None, at_timeout),
            f.store.close_listener(listeners[0].id, ListenerStatus::Expired, None, at_timeout),
        );
        assert!(by_event.unwrap() ^ by_timeout.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_closes_wait_and_listener() {
        let f = fixture();
        let now = Utc::now();
        let wait = f.scheduler.enter(&f.execution, "w", &event_wait(None), &f.contact, now).await.unwrap();

        let cancelled = f.scheduler.cancel_for_execution(f.execution.id, now).await.unwrap().unwrap();
        assert_eq!(cancelled.status, WaitStatus::Cancelled);
        assert_eq!(cancelled.resumed_by, Some(ResumedBy::Cancelled));

        let listener = f.store.find_listener_for_wait(wait.id).await.unwrap().unwrap();
        assert_eq!(listener.status, ListenerStatus::Expired);
        assert!(f.scheduler.cancel_for_execution(f.execution.id, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manual_resume() {
        let f = fixture();
        let now = Utc::now();
        let wait = f.scheduler.enter(&f.execution, "w", &event_wait(None), &f.contact, now).await.unwrap();

        let resumed = f.scheduler.manual_resume(wait.id, now).await.unwrap().unwrap();
        assert_eq!(resumed.status, WaitStatus::Scheduled);
        assert_eq!(resumed.resumer(), ResumedBy::Manual);

        // already due; a second manual resume is a no-op
        assert!(f.scheduler.manual_resume(wait.id, now).await.unwrap().is_none());
        assert!(f.scheduler.match_event(&opened(&f, "spring"), now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_resume_without_listener_is_reported() {
        let f = fixture();
        let mut orphan = WaitExecution::new(
            f.execution.id,
            "w",
            f.execution.account_id,
            f.execution.contact_id,
            WaitType::ForEvent,
        );
        orphan.status = WaitStatus::Waiting;
        f.store.insert_wait(&orphan).await.unwrap();

        let err = f.scheduler.manual_resume(orphan.id, Utc::now()).await.unwrap_err();
        assert_eq!(err, StoreError::ListenerNotFound(orphan.id));
        assert_eq!(f.store.get_wait(orphan.id).await.unwrap().status, WaitStatus::Waiting);
    }
}
