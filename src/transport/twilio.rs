//! Twilio Conversations transport: REST for outbound calls, a
//! post-event webhook for inbound messages and conversations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::middleware;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Form, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::adapters::conversation::ConversationTransport;
use crate::adapters::direct::{ConversationMessage, MediaRef};
use crate::config::TwilioConfig;
use crate::error::AdapterError;
use crate::model::Platform;
use crate::sync::{ConversationRef, PushEvent};
use crate::transport::signature::{TwilioVerifier, require_twilio_signature};
use crate::transport::webhook::WebhookHub;
use crate::transport::{check_status, read_json, request_error};

pub struct TwilioConversationsApi {
    client: reqwest::Client,
    account_sid: String,
    auth_token: SecretString,
    identity: String,
    proxy_address: Option<String>,
    api_base: String,
    timeout: Duration,
    hub: Arc<WebhookHub<ConversationMessage>>,
    verifier: Arc<TwilioVerifier>,
}

#[derive(Debug, Deserialize)]
struct ConversationResource {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: String,
}

impl TwilioConversationsApi {
    pub fn new(client: reqwest::Client, config: &TwilioConfig, timeout: Duration) -> Self {
        Self {
            client,
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            identity: config.identity.clone(),
            proxy_address: config.proxy_address.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            timeout,
            hub: Arc::new(WebhookHub::new()),
            verifier: Arc::new(TwilioVerifier::new(
                config.auth_token.clone(),
                config.webhook_url.clone(),
            )),
        }
    }

    /// Router serving `POST /twilio/events`.
    pub fn router(&self) -> Router {
        events_router(Arc::clone(&self.hub), Arc::clone(&self.verifier))
    }

    pub fn hub(&self) -> &Arc<WebhookHub<ConversationMessage>> {
        &self.hub
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.api_base)
    }

    async fn post_form(
        &self,
        operation: &str,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<reqwest::Response, AdapterError> {
        let resp = self
            .client
            .post(self.url(path))
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .form(form)
            .send()
            .await
            .map_err(|e| request_error(Platform::DirectMessage, operation, self.timeout, e))?;
        check_status(Platform::DirectMessage, operation, resp).await
    }
}

#[async_trait]
impl ConversationTransport for TwilioConversationsApi {
    type Raw = ConversationMessage;

    async fn initialize(&self) -> Result<(), AdapterError> {
        let resp = self
            .client
            .get(self.url("Conversations"))
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .query(&[("PageSize", "1")])
            .send()
            .await
            .map_err(|e| request_error(Platform::DirectMessage, "initialize", self.timeout, e))?;
        check_status(Platform::DirectMessage, "initialize", resp).await?;
        info!(identity = %self.identity, "Twilio credentials accepted");
        Ok(())
    }

    async fn listen(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<PushEvent<ConversationMessage>>, AdapterError> {
        Ok(self.hub.listen())
    }

    async fn subscribe(
        &self,
        conversation: &ConversationRef,
    ) -> Result<mpsc::UnboundedReceiver<ConversationMessage>, AdapterError> {
        Ok(self.hub.subscribe(&conversation.id))
    }

    async fn create_conversation(&self, recipient: &str) -> Result<ConversationRef, AdapterError> {
        let attributes = serde_json::json!({ "to": recipient }).to_string();
        let resp = self
            .post_form(
                "conversations.create",
                "Conversations",
                &[("FriendlyName", recipient), ("Attributes", attributes.as_str())],
            )
            .await?;
        let created: ConversationResource =
            read_json(Platform::DirectMessage, "conversations.create", resp).await?;

        match &self.proxy_address {
            Some(proxy) => {
                self.post_form(
                    "participants.create",
                    &format!("Conversations/{}/Participants", created.sid),
                    &[
                        ("MessagingBinding.Address", recipient),
                        ("MessagingBinding.ProxyAddress", proxy.as_str()),
                    ],
                )
                .await?;
            }
            None => debug!(
                conversation = %created.sid,
                "No proxy address configured; conversation has no messaging participant"
            ),
        }

        Ok(ConversationRef::new(created.sid).with_recipient(recipient))
    }

    async fn post(&self, conversation: &ConversationRef, body: &str) -> Result<String, AdapterError> {
        let resp = self
            .post_form(
                "messages.create",
                &format!("Conversations/{}/Messages", conversation.id),
                &[("Author", self.identity.as_str()), ("Body", body)],
            )
            .await?;
        let sent: MessageResource = read_json(Platform::DirectMessage, "messages.create", resp).await?;
        Ok(sent.sid)
    }

    async fn close(&self) {
        self.hub.close();
    }
}

// ── Post-event webhook ──────────────────────────────────────────────

/// Form body of a Conversations post-event webhook.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct WebhookForm {
    event_type: String,
    conversation_sid: String,
    message_sid: String,
    author: String,
    body: Option<String>,
    date_created: Option<String>,
    /// JSON array of media descriptors.
    media: Option<String>,
    /// JSON object; `to` names the remote party.
    attributes: Option<String>,
    #[serde(rename = "MessagingBinding.Address")]
    messaging_address: Option<String>,
}

impl WebhookForm {
    fn into_message(self) -> ConversationMessage {
        let media = self
            .media
            .as_deref()
            .map(|raw| {
                serde_json::from_str::<Vec<MediaRef>>(raw).unwrap_or_else(|e| {
                    warn!(message = %self.message_sid, error = %e, "Unreadable media list");
                    Vec::new()
                })
            })
            .unwrap_or_default();

        ConversationMessage {
            sid: self.message_sid,
            conversation_sid: self.conversation_sid,
            author: self.author,
            body: self.body,
            date_created: self.date_created,
            media,
        }
    }

    fn into_conversation(self) -> ConversationRef {
        let recipient = self
            .attributes
            .as_deref()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .and_then(|attrs| attrs.get("to").and_then(|v| v.as_str()).map(str::to_string))
            .or(self.messaging_address);

        let conversation = ConversationRef::new(self.conversation_sid);
        match recipient {
            Some(recipient) => conversation.with_recipient(recipient),
            None => conversation,
        }
    }
}

/// Build the webhook router over `hub`. Requests must carry a valid Twilio
/// signature.
pub fn events_router(hub: Arc<WebhookHub<ConversationMessage>>, verifier: Arc<TwilioVerifier>) -> Router {
    Router::new()
        .route("/twilio/events", post(twilio_events))
        .route_layer(middleware::from_fn_with_state(verifier, require_twilio_signature))
        .with_state(hub)
}

async fn twilio_events(
    State(hub): State<Arc<WebhookHub<ConversationMessage>>>,
    Form(form): Form<WebhookForm>,
) -> StatusCode {
    if form.conversation_sid.is_empty() {
        return StatusCode::BAD_REQUEST;
    }

    let delivered = match form.event_type.as_str() {
        "onMessageAdded" => {
            let conversation = form.conversation_sid.clone();
            hub.deliver_item(&conversation, form.into_message())
        }
        "onConversationAdded" => hub.announce_conversation(form.into_conversation()),
        other => {
            debug!(event_type = %other, "Ignoring Twilio event");
            return StatusCode::OK;
        }
    };
    if !delivered {
        warn!("Twilio event arrived with no active listener");
    }
    StatusCode::OK
}
