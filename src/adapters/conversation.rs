//! Push-discipline adapters built on conversations.
//!
//! Chat and direct messages share one driver, [`ConversationDriver`]; the
//! variants differ only in their transport and raw payload type.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::adapters::PlatformDriver;
use crate::error::AdapterError;
use crate::model::{CanonicalMessage, OutgoingMessage, Platform};
use crate::sync::{ConversationRef, Normalize, PushEvent, PushSource, SyncEngine, SyncExit};

/// A platform-native item that normalizes on its own.
pub trait ConversationPayload: Send + Sync + 'static {
    const PLATFORM: Platform;

    fn normalize(&self) -> Result<CanonicalMessage, AdapterError>;
}

/// Conversation-oriented push transport.
#[async_trait]
pub trait ConversationTransport: Send + Sync + 'static {
    type Raw: ConversationPayload;

    /// Validate credentials and prepare the client.
    async fn initialize(&self) -> Result<(), AdapterError>;

    /// Register the client-level listener. A second call replaces the first.
    async fn listen(&self) -> Result<mpsc::UnboundedReceiver<PushEvent<Self::Raw>>, AdapterError>;

    /// Subscribe to one conversation's future items.
    async fn subscribe(
        &self,
        conversation: &ConversationRef,
    ) -> Result<mpsc::UnboundedReceiver<Self::Raw>, AdapterError>;

    /// Open a new conversation with `recipient`.
    async fn create_conversation(&self, recipient: &str) -> Result<ConversationRef, AdapterError>;

    /// Post `body` into `conversation`. Returns the transport message id.
    async fn post(&self, conversation: &ConversationRef, body: &str) -> Result<String, AdapterError>;

    /// Drop every listener and subscription.
    async fn close(&self);
}

/// Known conversations, keyed by recipient.
#[derive(Debug, Default)]
pub struct ConversationDirectory {
    by_recipient: Mutex<HashMap<String, ConversationRef>>,
}

impl ConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a conversation. Conversations without a recipient are not
    /// addressable and are ignored.
    pub fn register(&self, conversation: &ConversationRef) {
        if let Some(recipient) = &conversation.recipient {
            self.map()
                .entry(recipient.clone())
                .or_insert_with(|| conversation.clone());
        }
    }

    pub fn lookup(&self, recipient: &str) -> Option<ConversationRef> {
        self.map().get(recipient).cloned()
    }

    /// Existing conversation for `recipient`, or a newly created one.
    ///
    /// If another conversation for the same recipient was registered while
    /// this one was being created, the first registered one wins.
    pub async fn resolve_or_create<T: ConversationTransport + ?Sized>(
        &self,
        transport: &T,
        recipient: &str,
    ) -> Result<ConversationRef, AdapterError> {
        if let Some(existing) = self.lookup(recipient) {
            return Ok(existing);
        }

        let created = transport.create_conversation(recipient).await?;
        let platform = <T::Raw as ConversationPayload>::PLATFORM;
        debug!(platform = %platform, conversation = %created.id, "Created conversation");
        let created = ConversationRef {
            recipient: Some(recipient.to_string()),
            ..created
        };
        Ok(self
            .map()
            .entry(recipient.to_string())
            .or_insert(created)
            .clone())
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConversationRef>> {
        self.by_recipient
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Driver shared by every conversation-style platform.
pub struct ConversationDriver<T> {
    transport: T,
    directory: ConversationDirectory,
}

impl<T: ConversationTransport> ConversationDriver<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            directory: ConversationDirectory::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn directory(&self) -> &ConversationDirectory {
        &self.directory
    }
}

impl<T: ConversationTransport> Normalize for ConversationDriver<T> {
    type Raw = T::Raw;

    fn platform(&self) -> Platform {
        <T::Raw as ConversationPayload>::PLATFORM
    }

    fn normalize(&self, raw: &T::Raw) -> Result<CanonicalMessage, AdapterError> {
        raw.normalize()
    }
}

#[async_trait]
impl<T: ConversationTransport> PushSource for ConversationDriver<T> {
    async fn listen(&self) -> Result<mpsc::UnboundedReceiver<PushEvent<T::Raw>>, AdapterError> {
        self.transport.listen().await
    }

    async fn subscribe(
        &self,
        conversation: &ConversationRef,
    ) -> Result<mpsc::UnboundedReceiver<T::Raw>, AdapterError> {
        self.directory.register(conversation);
        self.transport.subscribe(conversation).await
    }
}

#[async_trait]
impl<T: ConversationTransport> PlatformDriver for ConversationDriver<T> {
    async fn authenticate(&self) -> Result<(), AdapterError> {
        self.transport.initialize().await
    }

    async fn start_sync(
        driver: Arc<Self>,
        engine: Arc<SyncEngine>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<SyncExit>, AdapterError> {
        engine.start_push(driver, shutdown).await
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<String, AdapterError> {
        let conversation = self
            .directory
            .resolve_or_create(&self.transport, &message.recipient)
            .await?;
        self.transport.post(&conversation, &message.body).await
    }

    async fn close(&self) {
        self.transport.close().await;
    }
}
