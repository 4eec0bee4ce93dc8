//! Slack transport: Web API for outbound calls, Events API webhook for
//! inbound messages and conversations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::middleware;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::adapters::chat::SlackMessage;
use crate::adapters::conversation::ConversationTransport;
use crate::config::SlackConfig;
use crate::error::AdapterError;
use crate::model::Platform;
use crate::sync::{ConversationRef, PushEvent};
use crate::transport::signature::{SlackVerifier, require_slack_signature};
use crate::transport::webhook::WebhookHub;
use crate::transport::{check_status, read_json, request_error};

/// Web API error codes that mean the token is unusable.
const AUTH_ERRORS: &[&str] = &[
    "not_authed",
    "invalid_auth",
    "account_inactive",
    "token_revoked",
    "token_expired",
];

/// Message subtypes that do not represent a new message.
const IGNORED_SUBTYPES: &[&str] = &["message_changed", "message_deleted", "message_replied"];

// ── Web API ─────────────────────────────────────────────────────────

pub struct SlackApi {
    client: reqwest::Client,
    bot_token: SecretString,
    api_base: String,
    timeout: Duration,
    hub: Arc<WebhookHub<SlackMessage>>,
    verifier: Arc<SlackVerifier>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenResponse {
    channel: ChannelRef,
}

#[derive(Debug, Deserialize)]
struct PostResponse {
    channel: String,
    ts: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChannelRef {
    id: String,
}

impl SlackApi {
    pub fn new(client: reqwest::Client, config: &SlackConfig, timeout: Duration) -> Self {
        Self {
            client,
            bot_token: config.bot_token.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            timeout,
            hub: Arc::new(WebhookHub::new()),
            verifier: Arc::new(SlackVerifier::new(config.signing_secret.clone())),
        }
    }

    /// Router serving `POST /slack/events`.
    pub fn router(&self) -> Router {
        events_router(Arc::clone(&self.hub), Arc::clone(&self.verifier))
    }

    pub fn hub(&self) -> &Arc<WebhookHub<SlackMessage>> {
        &self.hub
    }

    /// Call a Web API method and decode its payload.
    ///
    /// Slack reports most failures as `200 OK` with `"ok": false`.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, AdapterError> {
        let resp = self
            .client
            .post(format!("{}/{method}", self.api_base))
            .bearer_auth(self.bot_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| request_error(Platform::Chat, method, self.timeout, e))?;
        let resp = check_status(Platform::Chat, method, resp).await?;
        let value: serde_json::Value = read_json(Platform::Chat, method, resp).await?;

        let envelope: Envelope = serde_json::from_value(value.clone())
            .map_err(|e| AdapterError::transport(Platform::Chat, format!("{method}: {e}")))?;
        if !envelope.ok {
            let code = envelope.error.unwrap_or_else(|| "unknown_error".into());
            return Err(if AUTH_ERRORS.contains(&code.as_str()) {
                AdapterError::declined(Platform::Chat, code)
            } else {
                AdapterError::transport(Platform::Chat, format!("{method}: {code}"))
            });
        }

        serde_json::from_value(value)
            .map_err(|e| AdapterError::transport(Platform::Chat, format!("{method}: {e}")))
    }
}

#[async_trait]
impl ConversationTransport for SlackApi {
    type Raw = SlackMessage;

    async fn initialize(&self) -> Result<(), AdapterError> {
        let _: serde_json::Value = self.call("auth.test", serde_json::json!({})).await?;
        info!("Slack token accepted");
        Ok(())
    }

    async fn listen(&self) -> Result<mpsc::UnboundedReceiver<PushEvent<SlackMessage>>, AdapterError> {
        Ok(self.hub.listen())
    }

    async fn subscribe(
        &self,
        conversation: &ConversationRef,
    ) -> Result<mpsc::UnboundedReceiver<SlackMessage>, AdapterError> {
        Ok(self.hub.subscribe(&conversation.id))
    }

    async fn create_conversation(&self, recipient: &str) -> Result<ConversationRef, AdapterError> {
        let opened: OpenResponse = self
            .call("conversations.open", serde_json::json!({ "users": recipient }))
            .await?;
        Ok(ConversationRef::new(opened.channel.id).with_recipient(recipient))
    }

    async fn post(&self, conversation: &ConversationRef, body: &str) -> Result<String, AdapterError> {
        let posted: PostResponse = self
            .call(
                "chat.postMessage",
                serde_json::json!({ "channel": conversation.id, "text": body }),
            )
            .await?;
        // Same id scheme as inbound messages.
        Ok(format!("{}:{}", posted.channel, posted.ts))
    }

    async fn close(&self) {
        self.hub.close();
    }
}

// ── Events API webhook ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EventEnvelope {
    UrlVerification { challenge: String },
    EventCallback { event: SlackEvent },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SlackEvent {
    Message(SlackMessage),
    ChannelCreated { channel: ChannelRef },
    ImCreated { user: String, channel: ChannelRef },
    #[serde(other)]
    Other,
}

/// Build the Events API router over `hub`. Requests must carry a valid
/// Slack signature.
pub fn events_router(hub: Arc<WebhookHub<SlackMessage>>, verifier: Arc<SlackVerifier>) -> Router {
    Router::new()
        .route("/slack/events", post(slack_events))
        .route_layer(middleware::from_fn_with_state(verifier, require_slack_signature))
        .with_state(hub)
}

async fn slack_events(
    State(hub): State<Arc<WebhookHub<SlackMessage>>>,
    Json(envelope): Json<EventEnvelope>,
) -> Response {
    match envelope {
        EventEnvelope::UrlVerification { challenge } => {
            Json(serde_json::json!({ "challenge": challenge })).into_response()
        }
        EventEnvelope::EventCallback { event } => {
            dispatch(&hub, event);
            StatusCode::OK.into_response()
        }
        EventEnvelope::Other => StatusCode::OK.into_response(),
    }
}

fn dispatch(hub: &WebhookHub<SlackMessage>, event: SlackEvent) {
    let delivered = match event {
        SlackEvent::Message(message) => {
            if message
                .subtype
                .as_deref()
                .is_some_and(|s| IGNORED_SUBTYPES.contains(&s))
            {
                debug!(subtype = ?message.subtype, "Ignoring Slack message subtype");
                return;
            }
            let channel = message.channel.clone();
            hub.deliver_item(&channel, message)
        }
        SlackEvent::ChannelCreated { channel } => {
            hub.announce_conversation(ConversationRef::new(channel.id))
        }
        SlackEvent::ImCreated { user, channel } => {
            hub.announce_conversation(ConversationRef::new(channel.id).with_recipient(user))
        }
        SlackEvent::Other => return,
    };
    if !delivered {
        warn!("Slack event arrived with no active listener");
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::transport::signature::{SLACK_SIGNATURE_HEADER, SLACK_TIMESTAMP_HEADER, slack_signature};

    const SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";

    fn router(hub: Arc<WebhookHub<SlackMessage>>) -> Router {
        events_router(hub, Arc::new(SlackVerifier::new(SecretString::from(SECRET))))
    }

    fn unsigned_request() -> axum::http::request::Builder {
        Request::builder()
            .method("POST")
            .uri("/slack/events")
            .header("content-type", "application/json")
    }

    fn json_request(body: &str) -> Request<Body> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = slack_signature(SECRET, &timestamp, body.as_bytes()).unwrap();
        unsigned_request()
            .header(SLACK_TIMESTAMP_HEADER, timestamp)
            .header(SLACK_SIGNATURE_HEADER, signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn answers_url_verification() {
        let app = router(Arc::new(WebhookHub::new()));
        let resp = app
            .oneshot(json_request(
                r#"{"token":"t","challenge":"3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P","type":"url_verification"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            value["challenge"],
            "3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P"
        );
    }

    #[tokio::test]
    async fn message_event_reaches_listener() {
        let hub = Arc::new(WebhookHub::new());
        let mut listener = hub.listen();
        let app = router(Arc::clone(&hub));

        let resp = app
            .oneshot(json_request(
                r#"{"type":"event_callback","event":{"type":"message","channel":"C1","user":"U1","text":"hi","ts":"1767225600.000100"}}"#,
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        match listener.try_recv().unwrap() {
            PushEvent::ItemAdded(msg) => assert_eq!(msg.ts, "1767225600.000100"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn im_created_announces_conversation_with_recipient() {
        let hub = Arc::new(WebhookHub::new());
        let mut listener = hub.listen();
        let app = router(Arc::clone(&hub));

        app.oneshot(json_request(
            r#"{"type":"event_callback","event":{"type":"im_created","user":"U042","channel":{"id":"D024"}}}"#,
        ))
        .await
        .unwrap();

        match listener.try_recv().unwrap() {
            PushEvent::ConversationAdded(conv) => {
                assert_eq!(conv.id, "D024");
                assert_eq!(conv.recipient.as_deref(), Some("U042"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn edits_and_unknown_events_are_ignored() {
        let hub = Arc::new(WebhookHub::new());
        let mut listener = hub.listen();

        let edit = r#"{"type":"event_callback","event":{"type":"message","subtype":"message_changed","channel":"C1","ts":"1.2"}}"#;
        let reaction = r#"{"type":"event_callback","event":{"type":"reaction_added","user":"U1"}}"#;
        for body in [edit, reaction] {
            let resp = router(Arc::clone(&hub))
                .oneshot(json_request(body))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        assert!(listener.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsigned_or_forged_requests_are_rejected() {
        let hub = Arc::new(WebhookHub::new());
        let mut listener = hub.listen();
        let body = r#"{"type":"event_callback","event":{"type":"message","channel":"C1","user":"U1","text":"wire the money","ts":"1.1"}}"#;

        let unsigned = unsigned_request().body(Body::from(body)).unwrap();
        let resp = router(Arc::clone(&hub)).oneshot(unsigned).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let timestamp = chrono::Utc::now().timestamp().to_string();
        let forged = unsigned_request()
            .header(SLACK_TIMESTAMP_HEADER, timestamp.as_str())
            .header(
                SLACK_SIGNATURE_HEADER,
                slack_signature("guessed", &timestamp, body.as_bytes()).unwrap(),
            )
            .body(Body::from(body))
            .unwrap();
        let resp = router(Arc::clone(&hub)).oneshot(forged).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let stale = (chrono::Utc::now().timestamp() - 3600).to_string();
        let replayed = unsigned_request()
            .header(SLACK_TIMESTAMP_HEADER, stale.as_str())
            .header(SLACK_SIGNATURE_HEADER, slack_signature(SECRET, &stale, body.as_bytes()).unwrap())
            .body(Body::from(body))
            .unwrap();
        let resp = router(Arc::clone(&hub)).oneshot(replayed).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        assert!(listener.try_recv().is_err());
    }
}
