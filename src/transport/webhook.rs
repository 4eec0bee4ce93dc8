//! In-process fan-out for webhook deliveries.
//!
//! Items for a conversation with live subscribers go to every one of those
//! subscribers; everything else goes to the client-level listener.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::trace;

use crate::sync::{ConversationRef, PushEvent};

pub struct WebhookHub<R> {
    listener: Mutex<Option<mpsc::UnboundedSender<PushEvent<R>>>>,
    conversations: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<R>>>>,
}

impl<R> Default for WebhookHub<R> {
    fn default() -> Self {
        Self {
            listener: Mutex::new(None),
            conversations: Mutex::new(HashMap::new()),
        }
    }
}

impl<R: Clone + Send + 'static> WebhookHub<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the client-level listener, replacing any previous one.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<PushEvent<R>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.listener) = Some(tx);
        rx
    }

    /// Subscribe to items of one conversation.
    pub fn subscribe(&self, conversation_id: &str) -> mpsc::UnboundedReceiver<R> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.conversations)
            .entry(conversation_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Route an item. Returns `false` if nobody was listening.
    pub fn deliver_item(&self, conversation_id: &str, item: R) -> bool {
        {
            let mut conversations = lock(&self.conversations);
            if let Some(subscribers) = conversations.get_mut(conversation_id) {
                subscribers.retain(|tx| tx.send(item.clone()).is_ok());
                if !subscribers.is_empty() {
                    trace!(conversation = %conversation_id, "Delivered to conversation subscribers");
                    return true;
                }
                conversations.remove(conversation_id);
            }
        }
        self.send_to_listener(PushEvent::ItemAdded(item))
    }

    /// Announce a new conversation to the client-level listener.
    pub fn announce_conversation(&self, conversation: ConversationRef) -> bool {
        self.send_to_listener(PushEvent::ConversationAdded(conversation))
    }

    /// Drop the listener and every subscription; their receivers then end.
    pub fn close(&self) {
        lock(&self.listener).take();
        lock(&self.conversations).clear();
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.conversations)
            .values()
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .sum()
    }

    fn send_to_listener(&self, event: PushEvent<R>) -> bool {
        match lock(&self.listener).as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsubscribed_items_reach_listener() {
        let hub = WebhookHub::new();
        let mut listener = hub.listen();

        assert!(hub.deliver_item("C1", "a"));
        assert!(matches!(listener.try_recv(), Ok(PushEvent::ItemAdded("a"))));
    }

    #[test]
    fn subscribed_items_reach_subscriber_only() {
        let hub = WebhookHub::new();
        let mut listener = hub.listen();
        let mut sub = hub.subscribe("C1");

        assert!(hub.deliver_item("C1", "a"));
        assert_eq!(sub.try_recv().unwrap(), "a");
        assert!(listener.try_recv().is_err());
    }

    #[test]
    fn dropped_subscriber_falls_back_to_listener() {
        let hub = WebhookHub::new();
        let mut listener = hub.listen();
        drop(hub.subscribe("C1"));

        assert!(hub.deliver_item("C1", "a"));
        assert!(matches!(listener.try_recv(), Ok(PushEvent::ItemAdded("a"))));
        assert_eq!(hub.subscription_count(), 0);
    }

    #[test]
    fn nothing_listening() {
        let hub: WebhookHub<&str> = WebhookHub::new();
        assert!(!hub.deliver_item("C1", "a"));
        assert!(!hub.announce_conversation(ConversationRef::new("C2")));
    }

    #[test]
    fn close_ends_receivers() {
        let hub: WebhookHub<&str> = WebhookHub::new();
        let mut listener = hub.listen();
        let mut sub = hub.subscribe("C1");
        hub.close();

        assert!(matches!(
            listener.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(matches!(
            sub.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
