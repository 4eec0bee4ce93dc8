//! Error types for the unified inbox.

use std::time::Duration;

use serde::Serialize;

use crate::lifecycle::ConnectionStatus;
use crate::model::Platform;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Event handler error: {0}")]
    Handler(#[from] HandlerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors surfaced by a platform adapter: connect, sync, normalize and send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterError {
    /// The user or credential was rejected. Terminal for the attempt.
    #[error("Authentication declined for {platform}: {reason}")]
    AuthenticationDeclined { platform: Platform, reason: String },

    #[error("{platform} {operation} timed out after {timeout:?}")]
    TransportTimeout {
        platform: Platform,
        operation: String,
        timeout: Duration,
    },

    /// A single payload could not be normalized; only that item is dropped.
    #[error("Malformed {platform} payload: {reason}")]
    MalformedPayload { platform: Platform, reason: String },

    #[error("{platform} adapter is not connected (status: {status})")]
    NotConnected {
        platform: Platform,
        status: ConnectionStatus,
    },

    #[error("{platform} transport error: {reason}")]
    Transport { platform: Platform, reason: String },
}

impl AdapterError {
    pub fn malformed(platform: Platform, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            platform,
            reason: reason.into(),
        }
    }

    pub fn transport(platform: Platform, reason: impl Into<String>) -> Self {
        Self::Transport {
            platform,
            reason: reason.into(),
        }
    }

    pub fn declined(platform: Platform, reason: impl Into<String>) -> Self {
        Self::AuthenticationDeclined {
            platform,
            reason: reason.into(),
        }
    }

    /// Whether a caller may reasonably try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportTimeout { .. } | Self::Transport { .. })
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthenticationDeclined { .. } => "authentication_declined",
            Self::TransportTimeout { .. } => "transport_timeout",
            Self::MalformedPayload { .. } => "malformed_payload",
            Self::NotConnected { .. } => "not_connected",
            Self::Transport { .. } => "transport",
        }
    }
}

/// Failure reported by an event-bus handler. Logged and isolated by the bus.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result type alias for the inbox.
pub type Result<T> = std::result::Result<T, Error>;
