//! Connection lifecycle state machine shared by every adapter.
//!
//! ```text
//! Uninitialized → Initializing → Connected → Disconnected
//!                     │    ↑         │
//!                     ↓    │         ↓
//!                     Failed ←───────┘
//! ```
//!
//! Any non-terminal state may also move to `Disconnected` when the adapter
//! is disposed. `Disconnected` is terminal for the instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::AdapterError;
use crate::events::{Event, EventBus};
use crate::model::Platform;

/// Maximum transitions kept in `ConnectionState::transitions`.
const MAX_TRANSITIONS: usize = 50;

/// Status of one adapter's external connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Uninitialized,
    Initializing,
    Connected,
    Failed,
    Disconnected,
}

impl ConnectionStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ConnectionStatus) -> bool {
        use ConnectionStatus::*;

        matches!(
            (self, target),
            (Uninitialized, Initializing) |
            (Initializing, Connected) | (Initializing, Failed) |
            (Connected, Failed) |
            // Explicit retry
            (Failed, Initializing) |
            // Disposal
            (Uninitialized, Disconnected) | (Initializing, Disconnected) |
            (Connected, Disconnected) | (Failed, Disconnected)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
        };
        write!(f, "{s}")
    }
}

/// A recorded status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusTransition {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Observable connection state of one adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub last_error: Option<AdapterError>,
    /// Retries since the last successful connect.
    pub retry_count: u32,
    pub transitions: Vec<StatusTransition>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Uninitialized,
            last_error: None,
            retry_count: 0,
            transitions: Vec::new(),
        }
    }
}

impl ConnectionState {
    /// Apply a transition in place.
    pub fn transition_to(
        &mut self,
        target: ConnectionStatus,
        reason: Option<String>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(target) {
            return Err(TransitionError {
                from: self.status,
                to: target,
            });
        }

        match (self.status, target) {
            (ConnectionStatus::Failed, ConnectionStatus::Initializing) => self.retry_count += 1,
            (_, ConnectionStatus::Connected) => {
                self.retry_count = 0;
                self.last_error = None;
            }
            _ => {}
        }

        self.transitions.push(StatusTransition {
            from: self.status,
            to: target,
            at: Utc::now(),
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.status = target;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Cannot transition from {from} to {to}")]
pub struct TransitionError {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
}

/// Owner of an adapter's `ConnectionState`.
///
/// The only writer of the state. Every change is published both on the
/// `watch` channel and as `connectionStatusChanged` on the event bus.
#[derive(Debug)]
pub struct Lifecycle {
    platform: Platform,
    state: watch::Sender<ConnectionState>,
    bus: EventBus,
}

impl Lifecycle {
    pub fn new(platform: Platform, bus: EventBus) -> Self {
        let (state, _rx) = watch::channel(ConnectionState::default());
        Self {
            platform,
            state,
            bus,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }

    pub fn snapshot(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Move to `target`, recording `reason` in the history.
    pub fn transition(
        &self,
        target: ConnectionStatus,
        reason: Option<String>,
    ) -> Result<(), TransitionError> {
        self.apply(target, reason, None)
    }

    /// Move to `Failed`, recording `error` as `last_error`.
    pub fn fail(&self, error: AdapterError) -> Result<(), TransitionError> {
        let reason = Some(error.to_string());
        self.apply(ConnectionStatus::Failed, reason, Some(error))
    }

    fn apply(
        &self,
        target: ConnectionStatus,
        reason: Option<String>,
        error: Option<AdapterError>,
    ) -> Result<(), TransitionError> {
        let mut outcome = Ok(());
        let mut from = target;
        self.state.send_if_modified(|state| {
            from = state.status;
            match state.transition_to(target, reason.clone()) {
                Ok(()) => {
                    if error.is_some() {
                        state.last_error = error.clone();
                    }
                    true
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });

        match &outcome {
            Ok(()) => {
                info!(platform = %self.platform, from = %from, to = %target, "Connection status changed");
                self.bus.emit(&Event::ConnectionStatusChanged {
                    platform: self.platform,
                    state: self.snapshot(),
                });
            }
            Err(e) => {
                warn!(platform = %self.platform, error = %e, "Rejected connection status change");
            }
        }
        outcome
    }
}
