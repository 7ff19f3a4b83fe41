// HTTP-backed collaborator adapters
//
// Actions are performed and contacts are owned by other services; the engine
// reaches them through these implementations of its capability traits.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use automation_engine::collaborators::{
    ActionDispatcher, CollaboratorError, ContactStore, DispatchContext, DispatchError, DispatchResult,
};
use automation_engine::contact::ContactSnapshot;
use automation_engine::definition::ActionKind;
use automation_engine::model::ContactSelection;

/// Shared HTTP client bound to one service
#[derive(Clone)]
pub struct ServiceClient {
    client: Client,
    base_url: String,
}

impl ServiceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("automation-worker/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Whether a failed response is worth another attempt
///
/// Server errors, timeouts and throttling are transient; any other client
/// error means the request itself is wrong.
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn dispatch_error_for_status(status: StatusCode, body: &str) -> DispatchError {
    let message = format!("action service returned {}: {}", status, truncate(body, 512));
    let code = format!("HTTP_{}", status.as_u16());
    if is_retryable_status(status) {
        DispatchError::retryable(message).with_code(code)
    } else {
        DispatchError::non_retryable(message).with_code(code)
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============================================================================
// HttpActionDispatcher
// ============================================================================

/// Dispatcher that POSTs each action to the action service
///
/// `POST {base}/actions/{action_type}` with the action config and the bound
/// context. The action execution id is sent as the idempotency key so a
/// retried attempt can be deduplicated by the service.
pub struct HttpActionDispatcher {
    service: ServiceClient,
}

impl HttpActionDispatcher {
    pub fn new(service: ServiceClient) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ActionDispatcher for HttpActionDispatcher {
    async fn dispatch(
        &self,
        action: &ActionKind,
        context: &DispatchContext,
    ) -> std::result::Result<DispatchResult, DispatchError> {
        let action_type = action.action_type();
        let url = self.service.url(&format!("/actions/{action_type}"));
        let body = json!({
            "action": action,
            "context": context,
        });

        let response = self
            .service
            .client
            .post(&url)
            .header("Idempotency-Key", context.action_execution_id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| DispatchError::retryable(format!("action service unreachable: {e}")).with_code("TRANSPORT"))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(
                execution_id = %context.execution_id,
                node_id = %context.node_id,
                action_type,
                status = status.as_u16(),
                "action service rejected dispatch"
            );
            return Err(dispatch_error_for_status(status, &text));
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(DispatchResult::completed(json!({})));
        }
        let result = response.json::<DispatchResult>().await.map_err(|e| {
            DispatchError::non_retryable(format!("unreadable action service response: {e}"))
                .with_code("INVALID_RESPONSE")
        })?;

        debug!(
            execution_id = %context.execution_id,
            node_id = %context.node_id,
            action_type,
            attempt = context.attempt,
            "action dispatched"
        );
        Ok(result)
    }
}

// ============================================================================
// HttpContactStore
// ============================================================================

#[derive(Debug, Deserialize)]
struct SelectionResponse {
    contact_ids: Vec<Uuid>,
}

/// Contact store backed by the contact service
///
/// - `GET {base}/contacts/{id}` returns a snapshot, 404 when absent
/// - `POST {base}/accounts/{account_id}/selections` resolves a selection
pub struct HttpContactStore {
    service: ServiceClient,
}

impl HttpContactStore {
    pub fn new(service: ServiceClient) -> Self {
        Self { service }
    }
}

fn unavailable(context: &str, err: impl std::fmt::Display) -> CollaboratorError {
    CollaboratorError::Unavailable(format!("{context}: {err}"))
}

#[async_trait]
impl ContactStore for HttpContactStore {
    async fn get_snapshot(&self, contact_id: Uuid) -> std::result::Result<Option<ContactSnapshot>, CollaboratorError> {
        let response = self
            .service
            .client
            .get(self.service.url(&format!("/contacts/{contact_id}")))
            .send()
            .await
            .map_err(|e| unavailable("contact lookup failed", e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<ContactSnapshot>()
                .await
                .map(Some)
                .map_err(|e| unavailable("unreadable contact", e)),
            status => Err(CollaboratorError::Unavailable(format!(
                "contact service returned {status}"
            ))),
        }
    }

    async fn resolve_selection(
        &self,
        account_id: Uuid,
        selection: &ContactSelection,
    ) -> std::result::Result<Vec<Uuid>, CollaboratorError> {
        let response = self
            .service
            .client
            .post(self.service.url(&format!("/accounts/{account_id}/selections")))
            .json(selection)
            .send()
            .await
            .map_err(|e| unavailable("selection request failed", e))?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
            let text = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Invalid(truncate(&text, 512).to_string()));
        }
        if !status.is_success() {
            return Err(CollaboratorError::Unavailable(format!(
                "contact service returned {status}"
            )));
        }

        let body: SelectionResponse = response
            .json()
            .await
            .map_err(|e| unavailable("unreadable selection", e))?;
        Ok(body.contact_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_dispatch_error_carries_status_code() {
        let err = dispatch_error_for_status(StatusCode::BAD_GATEWAY, "upstream down");
        assert!(err.retryable);
        assert_eq!(err.error_code.as_deref(), Some("HTTP_502"));

        let err = dispatch_error_for_status(StatusCode::UNPROCESSABLE_ENTITY, "bad template");
        assert!(!err.retryable);
        assert!(err.message.contains("bad template"));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let service = ServiceClient::new("http://actions.local/", Duration::from_secs(1)).unwrap();
        assert_eq!(service.url("/actions/send_email"), "http://actions.local/actions/send_email");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("short", 100), "short");
    }
}
