//! Inbound domain events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Well-known event types
pub mod event_types {
    pub const TAG_ADDED: &str = "tag_added";
    pub const TAG_REMOVED: &str = "tag_removed";
    pub const PURCHASE_COMPLETED: &str = "purchase_completed";
    pub const APPOINTMENT_BOOKED: &str = "appointment_booked";
    pub const FORM_SUBMITTED: &str = "form_submitted";
    pub const PIPELINE_STAGE_CHANGED: &str = "pipeline_stage_changed";
    pub const EMAIL_OPENED: &str = "email_opened";
    pub const EMAIL_CLICKED: &str = "email_clicked";
    pub const CONTACT_CREATED: &str = "contact_created";
    pub const CONTACT_UPDATED: &str = "contact_updated";
}

/// A domain event delivered by the event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    pub event_type: String,
    pub account_id: Uuid,
    pub contact_id: Uuid,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(
        event_type: impl Into<String>,
        account_id: Uuid,
        contact_id: Uuid,
        data: Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: event_type.into(),
            account_id,
            contact_id,
            correlation_id: None,
            data,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Document used for criteria matching: `data` fields at the top level
    /// plus `event_type`, `contact_id` and `correlation_id`
    pub fn to_document(&self) -> Value {
        let mut doc = match &self.data {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        doc.insert("event_type".to_string(), json!(self.event_type));
        doc.insert("contact_id".to_string(), json!(self.contact_id));
        doc.insert("correlation_id".to_string(), json!(self.correlation_id));
        doc.insert("data".to_string(), self.data.clone());
        Value::Object(doc)
    }
}
