// PostgreSQL LISTEN/NOTIFY event source
//
// Producers publish inbound events as JSON with
// `SELECT pg_notify('<channel>', '<event json>')`; each subscription holds its
// own listening connection.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use sqlx::postgres::{PgListener, PgNotification};
use sqlx::PgPool;
use tracing::{info, warn};

use automation_engine::collaborators::{CollaboratorError, EventBus};
use automation_engine::events::InboundEvent;

/// Event bus over a PostgreSQL notification channel
pub struct PgEventBus {
    pool: PgPool,
    channel: String,
}

impl PgEventBus {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }
}

/// Decode a notification payload, keeping only the wanted event types
fn decode(payload: &str, wanted: &[String]) -> Option<InboundEvent> {
    match serde_json::from_str::<InboundEvent>(payload) {
        Ok(event) if wanted.is_empty() || wanted.contains(&event.event_type) => Some(event),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "dropping malformed event notification");
            None
        }
    }
}

#[async_trait]
impl EventBus for PgEventBus {
    async fn subscribe(
        &self,
        event_types: &[String],
    ) -> Result<BoxStream<'static, InboundEvent>, CollaboratorError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("listen connection failed: {e}")))?;
        listener
            .listen(&self.channel)
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("listen failed: {e}")))?;

        info!(channel = %self.channel, event_types = ?event_types, "subscribed to event channel");

        let wanted = event_types.to_vec();
        let stream = listener
            .into_stream()
            .filter_map(move |item: Result<PgNotification, sqlx::Error>| {
                let event = match item {
                    Ok(notification) => decode(notification.payload(), &wanted),
                    Err(e) => {
                        warn!(error = %e, "event channel receive failed");
                        None
                    }
                };
                futures::future::ready(event)
            })
            .boxed();
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_decode_filters_event_types() {
        let event = InboundEvent::new("email_opened", Uuid::now_v7(), Uuid::now_v7(), serde_json::json!({}));
        let payload = serde_json::to_string(&event).unwrap();

        assert_eq!(decode(&payload, &[]), Some(event.clone()));
        assert_eq!(decode(&payload, &["email_opened".to_string()]), Some(event));
        assert_eq!(decode(&payload, &["tag_added".to_string()]), None);
    }

    #[test]
    fn test_decode_fills_defaults() {
        let account = Uuid::now_v7();
        let contact = Uuid::now_v7();
        let payload = format!(
            r#"{{"event_type":"tag_added","account_id":"{account}","contact_id":"{contact}","data":{{"tag":"vip"}}}}"#
        );
        let event = decode(&payload, &[]).unwrap();
        assert_eq!(event.contact_id, contact);
        assert_eq!(event.data["tag"], "vip");
        assert!(event.correlation_id.is_none());
    }

    #[test]
    fn test_decode_drops_malformed_payload() {
        assert_eq!(decode("not json", &[]), None);
    }
}
