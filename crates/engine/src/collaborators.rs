//! Capabilities the engine consumes but does not implement
//!
//! - [`DefinitionStore`]: read-only, version-pinned workflow snapshots
//! - [`ActionDispatcher`]: performs the side effect of an action node
//! - [`ContactStore`]: contact snapshots and bulk selections
//! - [`EventBus`]: inbound domain events

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::contact::ContactSnapshot;
use crate::definition::{ActionKind, DefinitionError, NodeId, WorkflowDefinition};
use crate::events::InboundEvent;
use crate::model::ContactSelection;

/// Errors from the contact store and event bus
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("invalid request: {0}")]
    Invalid(String),
}

// =============================================================================
// Definitions
// =============================================================================

#[async_trait]
pub trait DefinitionStore: Send + Sync + 'static {
    /// Snapshot of one workflow version
    async fn get(&self, workflow_id: Uuid, version: u32) -> Result<Arc<WorkflowDefinition>, DefinitionError>;

    /// Snapshot of the current published version
    async fn current(&self, workflow_id: Uuid) -> Result<Arc<WorkflowDefinition>, DefinitionError>;

    /// Current snapshots of active workflows triggered by `event_type`
    async fn list_triggered(
        &self,
        account_id: Uuid,
        event_type: &str,
    ) -> Result<Vec<Arc<WorkflowDefinition>>, DefinitionError>;

    /// Whether the workflow currently accepts and advances executions
    async fn is_workflow_active(&self, workflow_id: Uuid) -> Result<bool, DefinitionError>;
}

// =============================================================================
// Action dispatch
// =============================================================================

/// Everything a dispatcher needs to perform one action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchContext {
    pub execution_id: Uuid,
    pub action_execution_id: Uuid,
    pub workflow_id: Uuid,
    pub account_id: Uuid,
    pub node_id: NodeId,
    pub contact: ContactSnapshot,
    /// Input bound at dispatch time (action config, contact, prior results)
    pub execution_data: Value,
    /// 1-based attempt number
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Completed,
    /// The handler decided the action does not apply (e.g. no phone number)
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub status: DispatchStatus,
    pub result_data: Value,
}

impl DispatchResult {
    pub fn completed(result_data: Value) -> Self {
        Self {
            status: DispatchStatus::Completed,
            result_data,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: DispatchStatus::Skipped,
            result_data: serde_json::json!({ "reason": reason.into() }),
        }
    }
}

/// Failure reported by an action handler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchError {
    pub message: String,

    /// Error code for programmatic handling
    pub error_code: Option<String>,

    /// Non-retryable errors fail the execution without further attempts
    pub retryable: bool,

    pub details: Option<Value>,
}

impl DispatchError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: None,
            retryable: true,
            details: None,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: None,
            retryable: false,
            details: None,
        }
    }

    pub fn with_code(mut self, error_code: impl Into<String>) -> Self {
        self.error_code = Some(error_code.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_code {
            Some(code) => write!(f, "{} ({})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<anyhow::Error> for DispatchError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Performs the side effect of an action node
///
/// The engine decides when and with what payload to call the dispatcher;
/// how an email is sent or a webhook is called is the handler's business.
#[async_trait]
pub trait ActionDispatcher: Send + Sync + 'static {
    async fn dispatch(
        &self,
        action: &ActionKind,
        context: &DispatchContext,
    ) -> Result<DispatchResult, DispatchError>;
}

// =============================================================================
// Contacts
// =============================================================================

#[async_trait]
pub trait ContactStore: Send + Sync + 'static {
    /// Current snapshot of a contact; `None` if it does not exist
    async fn get_snapshot(&self, contact_id: Uuid) -> Result<Option<ContactSnapshot>, CollaboratorError>;

    /// Resolve a bulk selection to contact ids (duplicates allowed)
    async fn resolve_selection(
        &self,
        account_id: Uuid,
        selection: &ContactSelection,
    ) -> Result<Vec<Uuid>, CollaboratorError>;
}

// =============================================================================
// Events
// =============================================================================

#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    /// Subscribe to inbound events; an empty slice subscribes to everything
    async fn subscribe(
        &self,
        event_types: &[String],
    ) -> Result<BoxStream<'static, InboundEvent>, CollaboratorError>;
}
