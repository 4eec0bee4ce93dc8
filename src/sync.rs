//! Deduplicating sync engine.
//!
//! Drives one adapter's inbound side under either discipline:
//! - **pull**: fetch the unread set immediately, then again every tick;
//! - **push**: consume a transport listener, subscribing to each new
//!   conversation as it is announced.
//!
//! Both funnel through [`SyncEngine::ingest`]: normalize, check the
//! `(platform, id)` pair against the [`SeenIdRegistry`], publish once.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::SelectAll;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, trace, warn};

use crate::error::AdapterError;
use crate::events::{Event, EventBus};
use crate::model::{CanonicalMessage, MessageKey, Platform};

// ── Source traits ───────────────────────────────────────────────────

/// Pure conversion from a platform-native payload to a canonical message.
pub trait Normalize: Send + Sync + 'static {
    type Raw: Send + 'static;

    fn platform(&self) -> Platform;

    /// Must not perform I/O. Fails only with `MalformedPayload`.
    fn normalize(&self, raw: &Self::Raw) -> Result<CanonicalMessage, AdapterError>;
}

/// A transport that is polled for its current unread set.
#[async_trait]
pub trait PullSource: Normalize {
    /// Fetch the unread set. Items `engine` has already published may be
    /// left out; the engine drops them either way.
    async fn fetch_unread(&self, engine: &SyncEngine) -> Result<Vec<Self::Raw>, AdapterError>;
}

/// Handle to a conversation on a push transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationRef {
    pub id: String,
    /// Counterpart the conversation was opened with, when known.
    pub recipient: Option<String>,
}

impl ConversationRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            recipient: None,
        }
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }
}

/// Event delivered by a push transport's client-level listener.
#[derive(Debug, Clone)]
pub enum PushEvent<R> {
    ItemAdded(R),
    ConversationAdded(ConversationRef),
}

/// A transport that pushes events to registered listeners.
#[async_trait]
pub trait PushSource: Normalize {
    /// Register the client-level listener for item/conversation events.
    async fn listen(&self) -> Result<mpsc::UnboundedReceiver<PushEvent<Self::Raw>>, AdapterError>;

    /// Subscribe to future items of one conversation.
    async fn subscribe(
        &self,
        conversation: &ConversationRef,
    ) -> Result<mpsc::UnboundedReceiver<Self::Raw>, AdapterError>;
}

// ── Registry ────────────────────────────────────────────────────────

/// Message identities already delivered to the bus.
///
/// Grows for the lifetime of the adapter; there is no eviction.
#[derive(Debug, Default)]
pub struct SeenIdRegistry {
    seen: HashSet<MessageKey>,
}

impl SeenIdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key`. Returns `false` if it was already present.
    pub fn insert(&mut self, key: MessageKey) -> bool {
        self.seen.insert(key)
    }

    pub fn contains(&self, key: &MessageKey) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

// ── Engine ──────────────────────────────────────────────────────────

/// Why a sync loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncExit {
    /// Disposal was requested.
    Shutdown,
    /// The connection is no longer usable.
    Failed(AdapterError),
}

/// Per-adapter sync engine. Owns the adapter's dedup registry.
#[derive(Debug)]
pub struct SyncEngine {
    platform: Platform,
    seen: Mutex<SeenIdRegistry>,
    bus: EventBus,
}

impl SyncEngine {
    pub fn new(platform: Platform, bus: EventBus) -> Self {
        Self {
            platform,
            seen: Mutex::new(SeenIdRegistry::new()),
            bus,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Number of distinct messages published so far.
    pub fn seen_count(&self) -> usize {
        self.registry().len()
    }

    /// Whether this engine already published `id` for its platform.
    pub fn has_seen(&self, id: &str) -> bool {
        self.registry().contains(&MessageKey {
            platform: self.platform,
            id: id.to_string(),
        })
    }

    /// Publish `msg` unless its `(platform, id)` was already published.
    pub fn publish(&self, msg: CanonicalMessage) -> bool {
        let key = msg.key();
        if !self.registry().insert(key) {
            trace!(platform = %msg.platform, id = %msg.id, "Dropping duplicate message");
            return false;
        }
        debug!(platform = %msg.platform, id = %msg.id, priority = %msg.priority, "New message");
        self.bus.emit(&Event::MessageReceived(msg));
        true
    }

    /// Normalize and publish one raw payload. Malformed payloads are logged
    /// and dropped.
    pub fn ingest<S: Normalize + ?Sized>(&self, source: &S, raw: &S::Raw) -> bool {
        match source.normalize(raw) {
            Ok(msg) => self.publish(msg),
            Err(e) => {
                warn!(platform = %self.platform, error = %e, "Dropping payload that failed to normalize");
                false
            }
        }
    }

    /// Ingest a batch in transport order. Returns how many were published.
    pub fn ingest_batch<S: Normalize + ?Sized>(&self, source: &S, raws: &[S::Raw]) -> usize {
        raws.iter().filter(|raw| self.ingest(source, raw)).count()
    }

    /// One pull cycle: fetch the unread set and publish what is new.
    pub async fn poll_once<S: PullSource + ?Sized>(&self, source: &S) -> Result<usize, AdapterError> {
        let raws = source.fetch_unread(self).await?;
        Ok(self.ingest_batch(source, &raws))
    }

    /// Run the pull discipline until shutdown.
    ///
    /// The first tick fires immediately. Errors other than an authentication
    /// rejection are logged and the next tick still runs. Results of a fetch
    /// that completes after shutdown are discarded.
    pub fn spawn_pull<S: PullSource>(
        self: Arc<Self>,
        source: Arc<S>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<SyncExit> {
        tokio::spawn(async move {
            info!(platform = %self.platform, "Polling every {}s", interval.as_secs());

            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => {}
                }

                let fetched = source.fetch_unread(&self).await;
                if *shutdown.borrow() {
                    debug!(platform = %self.platform, "Discarding poll result after shutdown");
                    break;
                }

                match fetched {
                    Ok(raws) => {
                        let published = self.ingest_batch(&*source, &raws);
                        if published > 0 {
                            debug!(platform = %self.platform, fetched = raws.len(), published, "Poll tick");
                        }
                    }
                    Err(e @ AdapterError::AuthenticationDeclined { .. }) => {
                        error!(platform = %self.platform, error = %e, "Poll rejected, stopping sync");
                        return SyncExit::Failed(e);
                    }
                    Err(e) => {
                        error!(platform = %self.platform, error = %e, "Poll failed");
                    }
                }
            }

            info!(platform = %self.platform, "Poll loop shutting down");
            SyncExit::Shutdown
        })
    }

    /// Register the listener, then run the push discipline until shutdown.
    ///
    /// The listener is registered before this returns so no event delivered
    /// after connect is missed.
    pub async fn start_push<S: PushSource>(
        self: Arc<Self>,
        source: Arc<S>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<SyncExit>, AdapterError> {
        let mut listener = source.listen().await?;

        Ok(tokio::spawn(async move {
            info!(platform = %self.platform, "Listening for pushed messages");

            let mut conversations: SelectAll<UnboundedReceiverStream<S::Raw>> = SelectAll::new();

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    event = listener.recv() => match event {
                        Some(PushEvent::ItemAdded(raw)) => {
                            self.ingest(&*source, &raw);
                        }
                        Some(PushEvent::ConversationAdded(conversation)) => {
                            match source.subscribe(&conversation).await {
                                Ok(rx) => {
                                    debug!(platform = %self.platform, conversation = %conversation.id, "Subscribed to new conversation");
                                    conversations.push(UnboundedReceiverStream::new(rx));
                                }
                                Err(e) => {
                                    warn!(platform = %self.platform, conversation = %conversation.id, error = %e, "Conversation subscription failed");
                                }
                            }
                        }
                        None if *shutdown.borrow() => break,
                        None => {
                            warn!(platform = %self.platform, "Transport listener closed");
                            return SyncExit::Failed(AdapterError::transport(
                                self.platform,
                                "listener closed by transport",
                            ));
                        }
                    },
                    Some(raw) = conversations.next(), if !conversations.is_empty() => {
                        self.ingest(&*source, &raw);
                    }
                }
            }

            info!(platform = %self.platform, "Listener shutting down");
            SyncExit::Shutdown
        }))
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, SeenIdRegistry> {
        self.seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;

    use super::*;
    use crate::model::Priority;

    /// Raw payload for the fake sources: `(id, body)`; empty id is malformed.
    type FakeRaw = (String, String);

    fn normalize_fake(platform: Platform, raw: &FakeRaw) -> Result<CanonicalMessage, AdapterError> {
        if raw.0.is_empty() {
            return Err(AdapterError::malformed(platform, "missing id"));
        }
        Ok(CanonicalMessage::new(
            platform,
            raw.0.clone(),
            "sender",
            raw.1.clone(),
            Utc::now(),
            Priority::Low,
        ))
    }

    fn raw(id: &str) -> FakeRaw {
        (id.to_string(), format!("body of {id}"))
    }

    struct FakePull {
        responses: Mutex<VecDeque<Result<Vec<FakeRaw>, AdapterError>>>,
        calls: AtomicUsize,
    }

    impl FakePull {
        fn new(responses: Vec<Result<Vec<FakeRaw>, AdapterError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Normalize for FakePull {
        type Raw = FakeRaw;
        fn platform(&self) -> Platform {
            Platform::Email
        }
        fn normalize(&self, raw: &FakeRaw) -> Result<CanonicalMessage, AdapterError> {
            normalize_fake(Platform::Email, raw)
        }
    }

    #[async_trait]
    impl PullSource for FakePull {
        async fn fetch_unread(&self, _engine: &SyncEngine) -> Result<Vec<FakeRaw>, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    struct FakePush {
        listener: Mutex<Option<mpsc::UnboundedReceiver<PushEvent<FakeRaw>>>>,
        conversations: Mutex<Vec<(String, mpsc::UnboundedReceiver<FakeRaw>)>>,
    }

    impl Normalize for FakePush {
        type Raw = FakeRaw;
        fn platform(&self) -> Platform {
            Platform::Chat
        }
        fn normalize(&self, raw: &FakeRaw) -> Result<CanonicalMessage, AdapterError> {
            normalize_fake(Platform::Chat, raw)
        }
    }

    #[async_trait]
    impl PushSource for FakePush {
        async fn listen(&self) -> Result<mpsc::UnboundedReceiver<PushEvent<FakeRaw>>, AdapterError> {
            self.listener
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| AdapterError::transport(Platform::Chat, "already listening"))
        }

        async fn subscribe(
            &self,
            conversation: &ConversationRef,
        ) -> Result<mpsc::UnboundedReceiver<FakeRaw>, AdapterError> {
            let mut convs = self.conversations.lock().unwrap();
            let pos = convs
                .iter()
                .position(|(id, _)| *id == conversation.id)
                .ok_or_else(|| AdapterError::transport(Platform::Chat, "unknown conversation"))?;
            Ok(convs.remove(pos).1)
        }
    }

    fn collecting_bus() -> (EventBus, Arc<Mutex<Vec<String>>>) {
        let bus = EventBus::new();
        let ids = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ids);
        bus.on_message(move |m| {
            sink.lock().unwrap().push(m.id.clone());
            Ok(())
        });
        (bus, ids)
    }

    #[test]
    fn registry_insert_reports_novelty() {
        let mut registry = SeenIdRegistry::new();
        let key = MessageKey {
            platform: Platform::Email,
            id: "m1".into(),
        };
        assert!(registry.insert(key.clone()));
        assert!(!registry.insert(key.clone()));
        assert!(registry.contains(&key));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn same_id_on_other_platform_is_distinct() {
        let (bus, ids) = collecting_bus();
        let email = SyncEngine::new(Platform::Email, bus.clone());
        let now = Utc::now();
        assert!(email.publish(CanonicalMessage::new(Platform::Email, "1", "a", "b", now, Priority::Low)));
        assert!(email.publish(CanonicalMessage::new(Platform::Chat, "1", "a", "b", now, Priority::Low)));
        assert!(!email.publish(CanonicalMessage::new(Platform::Email, "1", "a", "b", now, Priority::Low)));
        assert_eq!(ids.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_poll_fetches_emit_each_message_once() {
        let (bus, ids) = collecting_bus();
        let engine = SyncEngine::new(Platform::Email, bus);
        let source = FakePull::new(vec![
            Ok(vec![raw("a"), raw("b")]),
            Ok(vec![raw("a"), raw("b"), raw("c")]),
        ]);

        assert_eq!(engine.poll_once(&source).await.unwrap(), 2);
        assert_eq!(engine.poll_once(&source).await.unwrap(), 1);
        assert_eq!(*ids.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(engine.seen_count(), 3);
    }

    #[tokio::test]
    async fn malformed_item_is_dropped_and_batch_continues() {
        let (bus, ids) = collecting_bus();
        let engine = SyncEngine::new(Platform::Email, bus);
        let source = FakePull::new(vec![Ok(vec![raw("a"), raw(""), raw("b")])]);

        assert_eq!(engine.poll_once(&source).await.unwrap(), 2);
        assert_eq!(*ids.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn pull_loop_survives_failed_tick() {
        let (bus, ids) = collecting_bus();
        let engine = Arc::new(SyncEngine::new(Platform::Email, bus));
        let source = Arc::new(FakePull::new(vec![
            Ok(vec![raw("a")]),
            Err(AdapterError::transport(Platform::Email, "503")),
            Ok(vec![raw("a"), raw("b")]),
        ]));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = Arc::clone(&engine).spawn_pull(
            Arc::clone(&source),
            Duration::from_secs(10),
            shutdown_rx,
        );

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*ids.lock().unwrap(), vec!["a", "b"]);

        shutdown_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), SyncExit::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn pull_loop_stops_on_rejected_credentials() {
        let (bus, _ids) = collecting_bus();
        let engine = Arc::new(SyncEngine::new(Platform::Email, bus));
        let declined = AdapterError::declined(Platform::Email, "token revoked");
        let source = Arc::new(FakePull::new(vec![Err(declined.clone())]));
        let (_tx, rx) = watch::channel(false);

        let handle = engine.spawn_pull(source, Duration::from_secs(10), rx);
        assert_eq!(handle.await.unwrap(), SyncExit::Failed(declined));
    }

    #[tokio::test]
    async fn push_duplicates_are_dropped_in_order() {
        let (bus, ids) = collecting_bus();
        let engine = Arc::new(SyncEngine::new(Platform::Chat, bus));
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Arc::new(FakePush {
            listener: Mutex::new(Some(rx)),
            conversations: Mutex::new(Vec::new()),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = engine.start_push(source, shutdown_rx).await.unwrap();
        tx.send(PushEvent::ItemAdded(raw("A"))).unwrap();
        tx.send(PushEvent::ItemAdded(raw("B"))).unwrap();
        tx.send(PushEvent::ItemAdded(raw("A"))).unwrap();
        tokio::task::yield_now().await;

        for _ in 0..10 {
            if ids.lock().unwrap().len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*ids.lock().unwrap(), vec!["A", "B"]);

        shutdown_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), SyncExit::Shutdown);
    }

    #[tokio::test]
    async fn new_conversation_is_subscribed() {
        let (bus, ids) = collecting_bus();
        let engine = Arc::new(SyncEngine::new(Platform::Chat, bus));
        let (tx, rx) = mpsc::unbounded_channel();
        let (conv_tx, conv_rx) = mpsc::unbounded_channel();
        let source = Arc::new(FakePush {
            listener: Mutex::new(Some(rx)),
            conversations: Mutex::new(vec![("C9".to_string(), conv_rx)]),
        });
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let _handle = engine.start_push(source, shutdown_rx).await.unwrap();
        tx.send(PushEvent::ConversationAdded(ConversationRef::new("C9"))).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        conv_tx.send(raw("in-thread")).unwrap();
        for _ in 0..10 {
            if !ids.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*ids.lock().unwrap(), vec!["in-thread"]);
    }

    #[tokio::test]
    async fn closed_listener_reports_failure() {
        let (bus, _ids) = collecting_bus();
        let engine = Arc::new(SyncEngine::new(Platform::Chat, bus));
        let (tx, rx) = mpsc::unbounded_channel::<PushEvent<FakeRaw>>();
        let source = Arc::new(FakePush {
            listener: Mutex::new(Some(rx)),
            conversations: Mutex::new(Vec::new()),
        });
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = engine.start_push(source, shutdown_rx).await.unwrap();
        drop(tx);
        assert!(matches!(
            handle.await.unwrap(),
            SyncExit::Failed(AdapterError::Transport { .. })
        ));
    }
}
