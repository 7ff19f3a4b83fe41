//! Action kinds and their typed configurations

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A side-effecting step handed to the action dispatcher
///
/// Closed set: an unknown `action_type` fails when the definition snapshot is
/// loaded, never at dispatch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", content = "config", rename_all = "snake_case")]
pub enum ActionKind {
    SendEmail(SendEmailConfig),
    SendSms(SendSmsConfig),
    AddTag(TagConfig),
    RemoveTag(TagConfig),
    WebhookCall(WebhookConfig),
    UpdateContactField(UpdateFieldConfig),
    MovePipelineStage(PipelineStageConfig),
    CreateTask(CreateTaskConfig),
    InternalNotification(NotificationConfig),
    MakeCall(MakeCallConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendEmailConfig {
    pub template_id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub from_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendSmsConfig {
    pub message: String,
    #[serde(default)]
    pub from_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagConfig {
    pub tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Extra JSON merged into the bound payload
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateFieldConfig {
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStageConfig {
    pub pipeline_id: String,
    pub stage_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTaskConfig {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub assignee_id: Option<Uuid>,
    #[serde(default)]
    pub due_in_hours: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub recipients: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakeCallConfig {
    #[serde(default)]
    pub script_id: Option<String>,
    #[serde(default)]
    pub from_number: Option<String>,
}

impl ActionKind {
    /// Wire name of the action type
    pub fn action_type(&self) -> &'static str {
        match self {
            ActionKind::SendEmail(_) => "send_email",
            ActionKind::SendSms(_) => "send_sms",
            ActionKind::AddTag(_) => "add_tag",
            ActionKind::RemoveTag(_) => "remove_tag",
            ActionKind::WebhookCall(_) => "webhook_call",
            ActionKind::UpdateContactField(_) => "update_contact_field",
            ActionKind::MovePipelineStage(_) => "move_pipeline_stage",
            ActionKind::CreateTask(_) => "create_task",
            ActionKind::InternalNotification(_) => "internal_notification",
            ActionKind::MakeCall(_) => "make_call",
        }
    }

    /// Typed configuration as JSON
    pub fn config_json(&self) -> Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.get("config").cloned())
            .unwrap_or(Value::Null)
    }

    /// Semantic checks beyond what deserialization enforces
    pub fn validate(&self) -> Result<(), String> {
        fn required(name: &str, value: &str) -> Result<(), String> {
            if value.trim().is_empty() {
                Err(format!("{} must not be empty", name))
            } else {
                Ok(())
            }
        }

        match self {
            ActionKind::SendEmail(c) => required("template_id", &c.template_id),
            ActionKind::SendSms(c) => required("message", &c.message),
            ActionKind::AddTag(c) | ActionKind::RemoveTag(c) => required("tag", &c.tag),
            ActionKind::WebhookCall(c) => {
                required("url", &c.url)?;
                if !(c.url.starts_with("http://") || c.url.starts_with("https://")) {
                    return Err(format!("webhook url '{}' must be http(s)", c.url));
                }
                Ok(())
            }
            ActionKind::UpdateContactField(c) => required("field", &c.field),
            ActionKind::MovePipelineStage(c) => {
                required("pipeline_id", &c.pipeline_id)?;
                required("stage_id", &c.stage_id)
            }
            ActionKind::CreateTask(c) => required("title", &c.title),
            ActionKind::InternalNotification(c) => {
                required("message", &c.message)?;
                if c.recipients.is_empty() {
                    return Err("notification needs at least one recipient".to_string());
                }
                Ok(())
            }
            ActionKind::MakeCall(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_tagged_action() {
        let action: ActionKind = serde_json::from_value(json!({
            "action_type": "send_email",
            "config": {"template_id": "welcome", "subject": "Hi"}
        }))
        .unwrap();

        assert_eq!(action.action_type(), "send_email");
        assert_eq!(action.config_json()["template_id"], json!("welcome"));
    }

    #[test]
    fn test_unknown_action_type_rejected() {
        let result: Result<ActionKind, _> = serde_json::from_value(json!({
            "action_type": "launch_rocket",
            "config": {}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_webhook_defaults() {
        let action: ActionKind = serde_json::from_value(json!({
            "action_type": "webhook_call",
            "config": {"url": "https://hooks.example.com/x"}
        }))
        .unwrap();

        match action {
            ActionKind::WebhookCall(c) => {
                assert_eq!(c.method, HttpMethod::Post);
                assert!(c.headers.is_empty());
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_validate() {
        let ok = ActionKind::AddTag(TagConfig { tag: "lead".into() });
        assert!(ok.validate().is_ok());

        let empty = ActionKind::AddTag(TagConfig { tag: " ".into() });
        assert!(empty.validate().is_err());

        let bad_url = ActionKind::WebhookCall(WebhookConfig {
            url: "ftp://x".into(),
            method: HttpMethod::Post,
            headers: BTreeMap::new(),
            payload: None,
        });
        assert!(bad_url.validate().is_err());
    }
}
