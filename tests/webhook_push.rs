//! Push adapters end to end: webhook request → hub → push loop → inbox.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tower::ServiceExt;

use unified_inbox::adapters::chat::SlackMessage;
use unified_inbox::adapters::conversation::{ConversationPayload, ConversationTransport};
use unified_inbox::adapters::direct::ConversationMessage;
use unified_inbox::adapters::{Adapter, ChatDriver, DirectMessageDriver, ManagedAdapter};
use unified_inbox::error::AdapterError;
use unified_inbox::events::EventBus;
use unified_inbox::inbox::Inbox;
use unified_inbox::lifecycle::ConnectionStatus;
use unified_inbox::model::{OutgoingMessage, Platform, Priority};
use unified_inbox::sync::{ConversationRef, PushEvent};
use unified_inbox::transport::WebhookHub;
use unified_inbox::transport::signature::{
    SLACK_SIGNATURE_HEADER, SLACK_TIMESTAMP_HEADER, SlackVerifier, TWILIO_SIGNATURE_HEADER, TwilioVerifier,
    slack_signature, twilio_signature,
};
use unified_inbox::transport::{slack, twilio};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const SLACK_SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";
const TWILIO_TOKEN: &str = "twilio-auth-token";
const TWILIO_URL: &str = "https://inbox.example.com/twilio/events";

/// Conversation transport whose inbound side is a real webhook hub and whose
/// outbound side records calls.
struct HubTransport<R> {
    hub: Arc<WebhookHub<R>>,
    creates: AtomicUsize,
    posts: Mutex<Vec<(String, String)>>,
}

impl<R> HubTransport<R> {
    fn new(hub: Arc<WebhookHub<R>>) -> Self {
        Self {
            hub,
            creates: AtomicUsize::new(0),
            posts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl<R: ConversationPayload + Clone> ConversationTransport for HubTransport<R> {
    type Raw = R;

    async fn initialize(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn listen(&self) -> Result<mpsc::UnboundedReceiver<PushEvent<R>>, AdapterError> {
        Ok(self.hub.listen())
    }

    async fn subscribe(
        &self,
        conversation: &ConversationRef,
    ) -> Result<mpsc::UnboundedReceiver<R>, AdapterError> {
        Ok(self.hub.subscribe(&conversation.id))
    }

    async fn create_conversation(&self, recipient: &str) -> Result<ConversationRef, AdapterError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ConversationRef::new(format!("NEW{n}")).with_recipient(recipient))
    }

    async fn post(&self, conversation: &ConversationRef, body: &str) -> Result<String, AdapterError> {
        let mut posts = self.posts.lock().unwrap();
        posts.push((conversation.id.clone(), body.to_string()));
        Ok(format!("{}:out{}", conversation.id, posts.len()))
    }

    async fn close(&self) {
        self.hub.close();
    }
}

async fn wait_for(cond: impl Fn() -> bool) {
    timeout(TEST_TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn post(
    app: &Router,
    uri: &str,
    content_type: &str,
    headers: &[(&str, String)],
    body: String,
) -> StatusCode {
    let mut request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", content_type);
    for (name, value) in headers {
        request = request.header(*name, value.as_str());
    }
    let request = request.body(Body::from(body)).unwrap();
    app.clone().oneshot(request).await.unwrap().status()
}

// ── Chat ────────────────────────────────────────────────────────────

fn slack_message(channel: &str, ts: &str, text: &str) -> String {
    serde_json::json!({
        "type": "event_callback",
        "event": {"type": "message", "channel": channel, "user": "U042", "text": text, "ts": ts}
    })
    .to_string()
}

fn slack_router(hub: &Arc<WebhookHub<SlackMessage>>) -> Router {
    let verifier = Arc::new(SlackVerifier::new(SecretString::from(SLACK_SECRET)));
    slack::events_router(Arc::clone(hub), verifier)
}

async fn slack_event(app: &Router, body: String) {
    let timestamp = chrono::Utc::now().timestamp().to_string();
    let signature = slack_signature(SLACK_SECRET, &timestamp, body.as_bytes()).unwrap();
    let headers = [(SLACK_TIMESTAMP_HEADER, timestamp), (SLACK_SIGNATURE_HEADER, signature)];
    assert_eq!(
        post(app, "/slack/events", "application/json", &headers, body).await,
        StatusCode::OK
    );
}

#[tokio::test]
async fn chat_duplicates_are_emitted_once_in_order() {
    let bus = EventBus::new();
    let (inbox, _) = Inbox::attached(&bus);
    let emissions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&emissions);
    bus.on_message(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let hub = Arc::new(WebhookHub::<SlackMessage>::new());
    let app = slack_router(&hub);
    let adapter = ManagedAdapter::new(ChatDriver::new(HubTransport::new(hub)), bus.clone());
    assert!(adapter.connect().await);

    let a = slack_message("C1", "1767225600.000100", "ASAP: build is red");
    let b = slack_message("C1", "1767225601.000200", "thanks");
    let c = slack_message("C2", "1767225602.000300", "status update?");
    for body in [a.clone(), b, a, c] {
        slack_event(&app, body).await;
    }

    wait_for(|| inbox.len() == 3).await;
    assert_eq!(emissions.load(Ordering::SeqCst), 3);

    let snapshot = inbox.snapshot();
    let ids: Vec<_> = snapshot.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["C1:1767225600.000100", "C1:1767225601.000200", "C2:1767225602.000300"]
    );
    assert_eq!(snapshot[0].priority, Priority::Urgent);
    assert_eq!(snapshot[2].priority, Priority::FollowUp);
    assert!(snapshot.iter().all(|m| m.platform == Platform::Chat));
}

#[tokio::test]
async fn announced_conversation_is_followed_and_reused_for_send() {
    let bus = EventBus::new();
    let (inbox, _) = Inbox::attached(&bus);
    let hub = Arc::new(WebhookHub::<SlackMessage>::new());
    let app = slack_router(&hub);
    let adapter = ManagedAdapter::new(ChatDriver::new(HubTransport::new(Arc::clone(&hub))), bus);
    assert!(adapter.connect().await);

    slack_event(
        &app,
        serde_json::json!({
            "type": "event_callback",
            "event": {"type": "im_created", "user": "U042", "channel": {"id": "D024"}}
        })
        .to_string(),
    )
    .await;
    wait_for(|| hub.subscription_count() == 1).await;

    // Routed through the conversation subscription.
    slack_event(&app, slack_message("D024", "1767225600.000100", "hey")).await;
    wait_for(|| inbox.len() == 1).await;

    let id = adapter.send(&OutgoingMessage::new("U042", "hi back")).await.unwrap();
    assert_eq!(id, "D024:out1");
    adapter.send(&OutgoingMessage::new("U099", "hello")).await.unwrap();

    let transport = adapter.driver().transport();
    assert_eq!(transport.creates.load(Ordering::SeqCst), 1);
    let posts = transport.posts.lock().unwrap().clone();
    assert_eq!(
        posts,
        vec![
            ("D024".to_string(), "hi back".to_string()),
            ("NEW1".to_string(), "hello".to_string()),
        ]
    );
}

#[tokio::test]
async fn disconnect_closes_the_hub() {
    let bus = EventBus::new();
    let hub = Arc::new(WebhookHub::<SlackMessage>::new());
    let adapter = ManagedAdapter::new(ChatDriver::new(HubTransport::new(Arc::clone(&hub))), bus);
    assert!(adapter.connect().await);

    adapter.disconnect().await;

    assert_eq!(adapter.connection_status(), ConnectionStatus::Disconnected);
    assert!(!hub.deliver_item("C1", SlackMessage::default()));
}

// ── Direct messages ─────────────────────────────────────────────────

fn twilio_router(hub: &Arc<WebhookHub<ConversationMessage>>) -> Router {
    let verifier = Arc::new(TwilioVerifier::new(SecretString::from(TWILIO_TOKEN), TWILIO_URL));
    twilio::events_router(Arc::clone(hub), verifier)
}

async fn twilio_event(app: &Router, body: &str) {
    let params: Vec<(String, String)> = url::form_urlencoded::parse(body.as_bytes()).into_owned().collect();
    let params: Vec<(&str, &str)> = params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let signature = twilio_signature(TWILIO_TOKEN, TWILIO_URL, &params).unwrap();
    let status = post(
        app,
        "/twilio/events",
        "application/x-www-form-urlencoded",
        &[(TWILIO_SIGNATURE_HEADER, signature)],
        body.to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn direct_messages_flow_and_malformed_items_are_skipped() {
    let bus = EventBus::new();
    let (inbox, _) = Inbox::attached(&bus);
    let hub = Arc::new(WebhookHub::<ConversationMessage>::new());
    let app = twilio_router(&hub);
    let adapter = ManagedAdapter::new(
        DirectMessageDriver::new(HubTransport::new(Arc::clone(&hub))),
        bus,
    );
    assert!(adapter.connect().await);

    twilio_event(
        &app,
        "EventType=onConversationAdded&ConversationSid=CH1\
         &Attributes=%7B%22to%22%3A%22whatsapp%3A%2B15550100%22%7D",
    )
    .await;
    wait_for(|| hub.subscription_count() == 1).await;

    // No DateCreated: cannot be normalized.
    twilio_event(
        &app,
        "EventType=onMessageAdded&ConversationSid=CH1&MessageSid=IM0&Author=whatsapp%3A%2B15550100&Body=broken",
    )
    .await;
    twilio_event(
        &app,
        "EventType=onMessageAdded&ConversationSid=CH1&MessageSid=IM1\
         &Author=whatsapp%3A%2B15550100&Body=Emergency%21+call+me\
         &DateCreated=2026-02-15T10%3A00%3A00Z\
         &Media=%5B%7B%22Sid%22%3A%22ME1%22%2C%22Filename%22%3A%22photo.jpg%22%7D%5D",
    )
    .await;

    wait_for(|| inbox.len() == 1).await;
    let msg = inbox.get(Platform::DirectMessage, "IM1").unwrap();
    assert_eq!(msg.sender, "whatsapp:+15550100");
    assert_eq!(msg.priority, Priority::Urgent);
    assert_eq!(msg.attachments, vec!["photo.jpg"]);
    assert!(inbox.get(Platform::DirectMessage, "IM0").is_none());
    assert_eq!(adapter.connection_status(), ConnectionStatus::Connected);

    let id = adapter
        .send(&OutgoingMessage::new("whatsapp:+15550100", "On my way"))
        .await
        .unwrap();
    assert_eq!(id, "CH1:out1");
    assert_eq!(adapter.driver().transport().creates.load(Ordering::SeqCst), 0);
}
