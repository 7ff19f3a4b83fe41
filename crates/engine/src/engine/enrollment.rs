//! Enrollment: creating new executions

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use super::error::EngineError;
use crate::collaborators::{ContactStore, DefinitionStore};
use crate::definition::{DefinitionError, NodeId};
use crate::model::{EnrollmentSource, WorkflowExecution};
use crate::persistence::{EngineStore, StoreError};

/// Request to enroll one contact into one workflow
#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub workflow_id: Uuid,
    pub contact_id: Uuid,
    pub source: EnrollmentSource,
    pub metadata: Value,
    /// Pin a specific version instead of the current one
    pub version: Option<u32>,
    /// Start somewhere other than the entry node
    pub start_node_id: Option<NodeId>,
}

impl EnrollRequest {
    pub fn new(workflow_id: Uuid, contact_id: Uuid, source: EnrollmentSource) -> Self {
        Self {
            workflow_id,
            contact_id,
            source,
            metadata: Value::Null,
            version: None,
            start_node_id: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn at_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn starting_at(mut self, node_id: impl Into<NodeId>) -> Self {
        self.start_node_id = Some(node_id.into());
        self
    }
}

/// Creates queued executions after checking enrollment preconditions
pub struct Enroller {
    store: Arc<dyn EngineStore>,
    definitions: Arc<dyn DefinitionStore>,
    contacts: Arc<dyn ContactStore>,
}

impl Enroller {
    pub fn new(
        store: Arc<dyn EngineStore>,
        definitions: Arc<dyn DefinitionStore>,
        contacts: Arc<dyn ContactStore>,
    ) -> Self {
        Self {
            store,
            definitions,
            contacts,
        }
    }

    /// Enroll a contact
    ///
    /// Checked in order: the workflow is active, the contact exists, the
    /// contact has not opted out, and the contact has no open execution of
    /// the workflow. The last check is enforced by the store.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id, contact_id = %request.contact_id, source = %request.source))]
    pub async fn enroll(&self, request: EnrollRequest) -> Result<WorkflowExecution, EngineError> {
        if !self.definitions.is_workflow_active(request.workflow_id).await? {
            return Err(EngineError::WorkflowNotActive(request.workflow_id));
        }

        let definition = match request.version {
            Some(version) => self.definitions.get(request.workflow_id, version).await?,
            None => self.definitions.current(request.workflow_id).await?,
        };

        let contact = self
            .contacts
            .get_snapshot(request.contact_id)
            .await?
            .ok_or(EngineError::ContactNotFound(request.contact_id))?;
        if contact.opted_out {
            return Err(EngineError::ContactOptedOut(request.contact_id));
        }

        let mut execution = WorkflowExecution::new(&definition, request.contact_id, request.source)
            .with_metadata(request.metadata);
        if let Some(node_id) = request.start_node_id {
            if !definition.has_node(&node_id) {
                return Err(DefinitionError::UnknownNode(node_id).into());
            }
            execution.current_node_id = Some(node_id);
        }

        match self.store.insert_execution(&execution).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(EngineError::DuplicateEnrollment {
                    workflow_id: request.workflow_id,
                    contact_id: request.contact_id,
                })
            }
            Err(e) => return Err(e.into()),
        }
        self.store
            .adjust_active_executions(execution.workflow_id, execution.workflow_version, 1)
            .await?;

        info!(
            execution_id = %execution.id,
            version = execution.workflow_version,
            "contact enrolled"
        );
        Ok(execution)
    }
}
