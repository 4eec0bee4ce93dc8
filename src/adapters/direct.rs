//! Direct-message adapter (SMS / WhatsApp) over Twilio Conversations.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::adapters::ManagedAdapter;
use crate::adapters::conversation::{ConversationDriver, ConversationPayload};
use crate::classifier::classify;
use crate::error::AdapterError;
use crate::model::{CanonicalMessage, Platform};

pub type DirectMessageDriver<T> = ConversationDriver<T>;
pub type DirectMessageAdapter<T> = ManagedAdapter<DirectMessageDriver<T>>;

/// A Conversations message resource.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConversationMessage {
    pub sid: String,
    pub conversation_sid: String,
    pub author: String,
    pub body: Option<String>,
    /// ISO 8601.
    pub date_created: Option<String>,
    pub media: Vec<MediaRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MediaRef {
    #[serde(alias = "Sid")]
    pub sid: String,
    #[serde(alias = "Filename")]
    pub filename: Option<String>,
    #[serde(alias = "ContentType")]
    pub content_type: Option<String>,
}

impl ConversationPayload for ConversationMessage {
    const PLATFORM: Platform = Platform::DirectMessage;

    fn normalize(&self) -> Result<CanonicalMessage, AdapterError> {
        if self.sid.is_empty() {
            return Err(AdapterError::malformed(Platform::DirectMessage, "message has no sid"));
        }
        let timestamp = self
            .date_created
            .as_deref()
            .and_then(|d| DateTime::parse_from_rfc3339(d.trim()).ok())
            .map(|d| d.with_timezone(&Utc))
            .ok_or_else(|| {
                AdapterError::malformed(
                    Platform::DirectMessage,
                    format!("message {} has no usable date_created", self.sid),
                )
            })?;

        let body = self.body.clone().unwrap_or_default();
        let attachments = self
            .media
            .iter()
            .map(|m| m.filename.clone().unwrap_or_else(|| m.sid.clone()))
            .collect();

        Ok(CanonicalMessage::new(
            Platform::DirectMessage,
            self.sid.clone(),
            self.author.clone(),
            body.clone(),
            timestamp,
            classify(&body, &self.author),
        )
        .with_attachments(attachments))
    }
}
