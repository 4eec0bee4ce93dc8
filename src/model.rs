//! Canonical message model shared by every adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source platform of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Email,
    Chat,
    DirectMessage,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Email, Platform::Chat, Platform::DirectMessage];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Chat => "chat",
            Self::DirectMessage => "direct-message",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority tier assigned once by the classifier at ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Urgent,
    FollowUp,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Urgent => "urgent",
            Self::FollowUp => "follow-up",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

/// Platform-independent representation of one communication item.
///
/// Every field except `read` is fixed at creation; `read` changes only
/// through consumer action (see `Inbox::mark_read`), never through sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    /// Platform-qualified id, stable across repeated fetches of the same item.
    pub id: String,
    pub platform: Platform,
    /// Display string for the sender.
    pub sender: String,
    /// Plain-text body.
    pub content: String,
    /// Source-of-truth ordering key.
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    pub read: bool,
    /// Attachment references, in source order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    /// Prior replies, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thread: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default)]
    pub draft: bool,
}

impl CanonicalMessage {
    /// Create an unread message with empty attachments, thread and labels.
    pub fn new(
        platform: Platform,
        id: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
        priority: Priority,
    ) -> Self {
        Self {
            id: id.into(),
            platform,
            sender: sender.into(),
            content: content.into(),
            timestamp,
            priority,
            read: false,
            attachments: Vec::new(),
            thread: Vec::new(),
            labels: Vec::new(),
            draft: false,
        }
    }

    pub fn with_read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_thread(mut self, thread: Vec<String>) -> Self {
        self.thread = thread;
        self
    }

    /// Set labels, dropping duplicates while keeping first-seen order.
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(labels.len());
        for label in labels {
            if !unique.contains(&label) {
                unique.push(label);
            }
        }
        self.labels = unique;
        self
    }

    /// Identity used by the dedup registry.
    pub fn key(&self) -> MessageKey {
        MessageKey {
            platform: self.platform,
            id: self.id.clone(),
        }
    }
}

/// `(platform, id)` pair identifying a message across the whole inbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub platform: Platform,
    pub id: String,
}

/// An outbound send request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub recipient: String,
    pub body: String,
    /// Used by platforms with a subject line; ignored elsewhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl OutgoingMessage {
    pub fn new(recipient: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            body: body.into(),
            subject: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}
