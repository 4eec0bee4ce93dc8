//! Unified Inbox: one stream of email, chat and direct messages.

pub mod adapters;
pub mod classifier;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod inbox;
pub mod lifecycle;
pub mod model;
pub mod sync;
pub mod transport;

pub use adapters::{Adapter, ManagedAdapter};
pub use error::{AdapterError, Error, Result};
pub use events::{Event, EventBus, EventKind};
pub use inbox::Inbox;
pub use lifecycle::{ConnectionState, ConnectionStatus};
pub use model::{CanonicalMessage, OutgoingMessage, Platform, Priority};
