//! Contact snapshot consumed by condition and goal evaluation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// A contact's position in one sales pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub pipeline_id: String,
    pub stage_id: String,
    #[serde(default)]
    pub entered_at: Option<DateTime<Utc>>,
}

/// Email engagement summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailEngagement {
    #[serde(default)]
    pub opened_campaigns: Vec<String>,
    #[serde(default)]
    pub clicked_campaigns: Vec<String>,
    #[serde(default)]
    pub last_opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_clicked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_opens: u64,
    #[serde(default)]
    pub total_clicks: u64,
}

/// Read-only view of a contact at evaluation time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactSnapshot {
    pub contact_id: Uuid,
    pub account_id: Uuid,

    /// Standard fields (email, first_name, phone, ...)
    #[serde(default)]
    pub fields: Map<String, Value>,

    #[serde(default)]
    pub custom_fields: Map<String, Value>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub pipeline_stages: Vec<PipelineStage>,

    #[serde(default)]
    pub engagement: EmailEngagement,

    #[serde(default)]
    pub opted_out: bool,

    /// Offset from UTC used for `until_time` waits
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

impl ContactSnapshot {
    pub fn new(contact_id: Uuid, account_id: Uuid) -> Self {
        Self {
            contact_id,
            account_id,
            fields: Map::new(),
            custom_fields: Map::new(),
            tags: Vec::new(),
            pipeline_stages: Vec::new(),
            engagement: EmailEngagement::default(),
            opted_out: false,
            utc_offset_minutes: None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_custom_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom_fields.insert(name.into(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_stage(mut self, pipeline_id: impl Into<String>, stage_id: impl Into<String>) -> Self {
        self.pipeline_stages.push(PipelineStage {
            pipeline_id: pipeline_id.into(),
            stage_id: stage_id.into(),
            entered_at: None,
        });
        self
    }

    pub fn opted_out(mut self) -> Self {
        self.opted_out = true;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Current stage in a pipeline, if the contact is in it
    pub fn stage_in(&self, pipeline_id: &str) -> Option<&PipelineStage> {
        self.pipeline_stages
            .iter()
            .find(|s| s.pipeline_id == pipeline_id)
    }

    /// Look up a field by name, standard fields first then custom fields
    ///
    /// A `custom.` prefix forces the custom field namespace.
    pub fn field(&self, name: &str) -> Option<&Value> {
        if let Some(custom) = name.strip_prefix("custom.") {
            return self.custom_fields.get(custom);
        }
        self.fields
            .get(name)
            .or_else(|| self.custom_fields.get(name))
    }

    /// Document form used for criteria matching and dispatch binding
    pub fn to_document(&self) -> Value {
        let mut doc = Map::new();
        for (k, v) in &self.custom_fields {
            doc.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.fields {
            doc.insert(k.clone(), v.clone());
        }
        doc.insert("id".to_string(), json!(self.contact_id));
        doc.insert("account_id".to_string(), json!(self.account_id));
        doc.insert("tags".to_string(), json!(self.tags));
        doc.insert("custom".to_string(), Value::Object(self.custom_fields.clone()));
        doc.insert("pipeline_stages".to_string(), json!(self.pipeline_stages));
        doc.insert("engagement".to_string(), json!(self.engagement));
        doc.insert("opted_out".to_string(), json!(self.opted_out));
        Value::Object(doc)
    }
}
