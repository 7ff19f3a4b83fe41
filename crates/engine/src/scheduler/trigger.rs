//! Trigger matching for inbound events

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::collaborators::DefinitionStore;
use crate::criteria;
use crate::definition::{DefinitionError, TriggerConfig, WorkflowDefinition};
use crate::events::InboundEvent;
use crate::persistence::{EngineStore, StoreError};

/// Whether an event satisfies a trigger's type and filters
pub fn matches(trigger: &TriggerConfig, event: &InboundEvent) -> bool {
    trigger.is_active
        && trigger.event_type == event.event_type
        && criteria::all_match(&trigger.filters, &event.to_document())
}

/// Errors while resolving trigger candidates
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Finds the workflows an inbound event should enroll its contact into
pub struct TriggerMatcher {
    store: Arc<dyn EngineStore>,
    definitions: Arc<dyn DefinitionStore>,
}

impl TriggerMatcher {
    pub fn new(store: Arc<dyn EngineStore>, definitions: Arc<dyn DefinitionStore>) -> Self {
        Self { store, definitions }
    }

    /// Active workflows whose trigger matches and whose entry rules admit
    /// the event's contact
    pub async fn candidates(
        &self,
        event: &InboundEvent,
    ) -> Result<Vec<Arc<WorkflowDefinition>>, TriggerError> {
        let mut eligible = Vec::new();
        let triggered = self
            .definitions
            .list_triggered(event.account_id, &event.event_type)
            .await?;

        for definition in triggered {
            let Some(trigger) = &definition.trigger else {
                continue;
            };
            if !matches(trigger, event) {
                continue;
            }
            if self.admits(&definition, trigger, event.contact_id).await? {
                eligible.push(definition);
            }
        }
        Ok(eligible)
    }

    /// A contact may enter when it has no open execution of the workflow,
    /// and only once ever unless the trigger allows re-entry
    async fn admits(
        &self,
        definition: &WorkflowDefinition,
        trigger: &TriggerConfig,
        contact_id: Uuid,
    ) -> Result<bool, StoreError> {
        let previous = self
            .store
            .find_executions_for_contact(definition.workflow_id, contact_id)
            .await?;

        if previous.iter().any(|e| !e.is_terminal()) {
            debug!(workflow_id = %definition.workflow_id, %contact_id, "contact already enrolled");
            return Ok(false);
        }
        if !previous.is_empty() && !trigger.allow_reentry {
            debug!(workflow_id = %definition.workflow_id, %contact_id, "re-entry not allowed");
            return Ok(false);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::{FieldCriterion, Operator};
    use serde_json::json;

    fn event(data: serde_json::Value) -> InboundEvent {
        InboundEvent::new("form_submitted", Uuid::now_v7(), Uuid::now_v7(), data)
    }

    #[test]
    fn test_trigger_filters() {
        let trigger = TriggerConfig::new("form_submitted")
            .with_filter(FieldCriterion::new("form_id", Operator::Equals, "newsletter"));

        assert!(matches(&trigger, &event(json!({"form_id": "newsletter"}))));
        assert!(!matches(&trigger, &event(json!({"form_id": "contact"}))));

        let mut other = event(json!({"form_id": "newsletter"}));
        other.event_type = "tag_added".into();
        assert!(!matches(&trigger, &other));
    }

    #[test]
    fn test_inactive_trigger_never_matches() {
        let mut trigger = TriggerConfig::new("form_submitted");
        trigger.is_active = false;
        assert!(!matches(&trigger, &event(json!({}))));
    }
}
