//! In-process event bus.
//!
//! Handlers run synchronously on the emitting task, in registration order.
//! A handler that returns an error or panics is logged and skipped; the
//! remaining handlers for the same emission still run. The handler list is
//! snapshotted before dispatch, so a handler may emit or (un)subscribe
//! without deadlocking; such changes take effect from the next emission.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::HandlerError;
use crate::lifecycle::ConnectionState;
use crate::model::{CanonicalMessage, Platform};

/// Event names understood by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    MessageReceived,
    ConnectionStatusChanged,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MessageReceived => "messageReceived",
            Self::ConnectionStatusChanged => "connectionStatusChanged",
        };
        f.write_str(s)
    }
}

/// An emitted event. `MessageReceived` always carries exactly one message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    MessageReceived(CanonicalMessage),
    ConnectionStatusChanged {
        platform: Platform,
        state: ConnectionState,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageReceived(_) => EventKind::MessageReceived,
            Self::ConnectionStatusChanged { .. } => EventKind::ConnectionStatusChanged,
        }
    }
}

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

type Handler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    handler: Handler,
}

/// Cloneable publish/subscribe hub shared by adapters and consumers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(Uuid::new_v4());
        self.lock().push(Subscription {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    /// Register a handler that only sees `messageReceived` payloads.
    pub fn on_message<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&CanonicalMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.on(EventKind::MessageReceived, move |event| match event {
            Event::MessageReceived(msg) => handler(msg),
            _ => Ok(()),
        })
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subs = self.lock();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Invoke every handler registered for the event's kind.
    ///
    /// Returns the number of handlers that completed successfully.
    pub fn emit(&self, event: &Event) -> usize {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .lock()
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| Arc::clone(&s.handler))
            .collect();

        trace!(event = %kind, handlers = handlers.len(), "Emitting event");

        let mut delivered = 0;
        for (index, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(event = %kind, handler = index, error = %e, "Event handler failed");
                }
                Err(_) => {
                    warn!(event = %kind, handler = index, "Event handler panicked");
                }
            }
        }
        delivered
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.lock().iter().filter(|s| s.kind == kind).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        // A poisoned lock only means a registration panicked mid-push; the
        // vector itself is still consistent.
        self.subscriptions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.lock().len())
            .finish()
    }
}
