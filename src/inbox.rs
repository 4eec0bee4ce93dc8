//! Inbox: the consumer-side message collection.
//!
//! Messages are held in arrival order. `read` is the only field a consumer
//! may change, through [`Inbox::mark_read`].

use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::events::{EventBus, SubscriptionId};
use crate::filter::{self, FilterSpec};
use crate::model::{CanonicalMessage, MessageKey, Platform};

#[derive(Default)]
struct Held {
    messages: Vec<CanonicalMessage>,
    keys: HashSet<MessageKey>,
}

/// Cloneable handle to a shared message collection.
#[derive(Clone, Default)]
pub struct Inbox {
    held: Arc<RwLock<Held>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an inbox fed by `messageReceived` events on `bus`.
    pub fn attached(bus: &EventBus) -> (Self, SubscriptionId) {
        let inbox = Self::new();
        let id = inbox.attach(bus);
        (inbox, id)
    }

    /// Start receiving messages from `bus`.
    pub fn attach(&self, bus: &EventBus) -> SubscriptionId {
        let inbox = self.clone();
        bus.on_message(move |msg| {
            inbox.push(msg.clone());
            Ok(())
        })
    }

    /// Append a message. Returns `false` if `(platform, id)` is already held.
    pub fn push(&self, msg: CanonicalMessage) -> bool {
        let mut held = self.write();
        if !held.keys.insert(msg.key()) {
            debug!(platform = %msg.platform, id = %msg.id, "Inbox already holds message");
            return false;
        }
        held.messages.push(msg);
        true
    }

    /// Set the read flag of one message. Returns `false` if it is not held.
    pub fn mark_read(&self, platform: Platform, id: &str, read: bool) -> bool {
        let mut held = self.write();
        let Some(msg) = held
            .messages
            .iter_mut()
            .find(|m| m.platform == platform && m.id == id)
        else {
            return false;
        };
        if msg.read != read {
            msg.read = read;
            info!(platform = %platform, id = %id, read, "Read state changed");
        }
        true
    }

    pub fn get(&self, platform: Platform, id: &str) -> Option<CanonicalMessage> {
        self.read()
            .messages
            .iter()
            .find(|m| m.platform == platform && m.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().messages.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.read().messages.iter().filter(|m| !m.read).count()
    }

    /// Every held message, in arrival order.
    pub fn snapshot(&self) -> Vec<CanonicalMessage> {
        self.read().messages.clone()
    }

    /// Held messages matching `spec`, in arrival order.
    pub fn view(&self, spec: &FilterSpec) -> Vec<CanonicalMessage> {
        filter::apply(&self.read().messages, spec)
    }

    fn read(&self) -> RwLockReadGuard<'_, Held> {
        self.held.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Held> {
        self.held.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Inbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox").field("messages", &self.len()).finish()
    }
}
