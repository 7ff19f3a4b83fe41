//! In-process collaborators for tests and local runs

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::collaborators::{
    ActionDispatcher, CollaboratorError, ContactStore, DispatchContext, DispatchError,
    DispatchResult, EventBus,
};
use crate::contact::ContactSnapshot;
use crate::definition::ActionKind;
use crate::events::InboundEvent;
use crate::model::ContactSelection;

// =============================================================================
// Contacts
// =============================================================================

/// Contact store backed by a map
#[derive(Default)]
pub struct InMemoryContactStore {
    contacts: RwLock<HashMap<Uuid, ContactSnapshot>>,
}

impl InMemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, contact: ContactSnapshot) {
        self.contacts.write().insert(contact.contact_id, contact);
    }

    pub fn remove(&self, contact_id: Uuid) {
        self.contacts.write().remove(&contact_id);
    }

    /// Apply a change to a stored contact
    pub fn update(&self, contact_id: Uuid, f: impl FnOnce(&mut ContactSnapshot)) {
        if let Some(contact) = self.contacts.write().get_mut(&contact_id) {
            f(contact);
        }
    }
}

#[async_trait]
impl ContactStore for InMemoryContactStore {
    async fn get_snapshot(&self, contact_id: Uuid) -> Result<Option<ContactSnapshot>, CollaboratorError> {
        Ok(self.contacts.read().get(&contact_id).cloned())
    }

    async fn resolve_selection(
        &self,
        account_id: Uuid,
        selection: &ContactSelection,
    ) -> Result<Vec<Uuid>, CollaboratorError> {
        match selection {
            ContactSelection::Manual { contact_ids } => Ok(contact_ids.clone()),
            ContactSelection::Filter { criteria } => {
                let contacts = self.contacts.read();
                let mut ids: Vec<Uuid> = contacts
                    .values()
                    .filter(|c| c.account_id == account_id)
                    .filter(|c| crate::criteria::all_match(criteria, &c.to_document()))
                    .map(|c| c.contact_id)
                    .collect();
                ids.sort();
                Ok(ids)
            }
            ContactSelection::Csv { content, column } => {
                let mut lines = content.lines();
                let header = lines
                    .next()
                    .ok_or_else(|| CollaboratorError::Invalid("empty CSV".into()))?;
                let index = header
                    .split(',')
                    .position(|h| h.trim() == column)
                    .ok_or_else(|| CollaboratorError::Invalid(format!("column '{column}' not found")))?;

                lines
                    .filter(|line| !line.trim().is_empty())
                    .map(|line| {
                        let cell = line.split(',').nth(index).unwrap_or("").trim();
                        Uuid::parse_str(cell)
                            .map_err(|_| CollaboratorError::Invalid(format!("invalid contact id '{cell}'")))
                    })
                    .collect()
            }
        }
    }
}

// =============================================================================
// Dispatch
// =============================================================================

type Reply = Result<DispatchResult, DispatchError>;

/// Dispatcher that replays queued replies per action type and records calls
///
/// With no reply queued, the call completes with `{"ok": true}`.
#[derive(Default)]
pub struct ScriptedDispatcher {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<(String, DispatchContext)>>,
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, action_type: &str, reply: Reply) {
        self.replies
            .lock()
            .entry(action_type.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn fail_times(&self, action_type: &str, times: usize, error: DispatchError) {
        for _ in 0..times {
            self.push_reply(action_type, Err(error.clone()));
        }
    }

    pub fn calls(&self) -> Vec<(String, DispatchContext)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, action_type: &str) -> usize {
        self.calls.lock().iter().filter(|(t, _)| t == action_type).count()
    }
}

#[async_trait]
impl ActionDispatcher for ScriptedDispatcher {
    async fn dispatch(&self, action: &ActionKind, context: &DispatchContext) -> Reply {
        let action_type = action.action_type().to_string();
        self.calls.lock().push((action_type.clone(), context.clone()));

        let reply = self
            .replies
            .lock()
            .get_mut(&action_type)
            .and_then(|queue| queue.pop_front());
        reply.unwrap_or_else(|| Ok(DispatchResult::completed(json!({ "ok": true }))))
    }
}

// =============================================================================
// Events
// =============================================================================

/// Event bus over a tokio broadcast channel
pub struct ChannelEventBus {
    sender: broadcast::Sender<InboundEvent>,
}

impl ChannelEventBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity);
        Arc::new(Self { sender })
    }

    /// Publish to current subscribers; returns how many received it
    pub fn publish(&self, event: InboundEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

#[async_trait]
impl EventBus for ChannelEventBus {
    async fn subscribe(
        &self,
        event_types: &[String],
    ) -> Result<BoxStream<'static, InboundEvent>, CollaboratorError> {
        let wanted = event_types.to_vec();
        let stream = BroadcastStream::new(self.sender.subscribe())
            .filter_map(move |item| {
                let keep = match item {
                    Ok(event) if wanted.is_empty() || wanted.contains(&event.event_type) => Some(event),
                    _ => None,
                };
                futures::future::ready(keep)
            })
            .boxed();
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_csv_selection() {
        let store = InMemoryContactStore::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let selection = ContactSelection::Csv {
            content: format!("email,contact_id\nx@example.com,{a}\ny@example.com,{b}\n"),
            column: "contact_id".into(),
        };

        let ids = assert_ok!(store.resolve_selection(Uuid::now_v7(), &selection).await);
        assert_eq!(ids, vec![a, b]);

        let bad = ContactSelection::Csv {
            content: "email\nx@example.com\n".into(),
            column: "contact_id".into(),
        };
        assert_err!(store.resolve_selection(Uuid::now_v7(), &bad).await);
    }

    #[tokio::test]
    async fn test_scripted_replies_then_default() {
        let dispatcher = ScriptedDispatcher::new();
        dispatcher.fail_times("add_tag", 1, DispatchError::retryable("boom"));

        let action = ActionKind::AddTag(crate::definition::TagConfig { tag: "vip".into() });
        let context = DispatchContext {
            execution_id: Uuid::now_v7(),
            action_execution_id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            account_id: Uuid::now_v7(),
            node_id: "tag".into(),
            contact: ContactSnapshot::new(Uuid::now_v7(), Uuid::now_v7()),
            execution_data: json!({}),
            attempt: 1,
        };

        assert_err!(dispatcher.dispatch(&action, &context).await);
        assert_ok!(dispatcher.dispatch(&action, &context).await);
        assert_eq!(dispatcher.call_count("add_tag"), 2);
    }
}
