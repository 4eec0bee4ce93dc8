//! Team-chat adapter over a Slack-shaped transport.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::adapters::ManagedAdapter;
use crate::adapters::conversation::{ConversationDriver, ConversationPayload};
use crate::classifier::classify;
use crate::error::AdapterError;
use crate::model::{CanonicalMessage, Platform};

pub type ChatDriver<T> = ConversationDriver<T>;
pub type ChatAdapter<T> = ManagedAdapter<ChatDriver<T>>;

/// A `message` event or `conversations.history` entry.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SlackMessage {
    pub channel: String,
    pub user: Option<String>,
    pub bot_id: Option<String>,
    pub text: String,
    /// Message timestamp, `"<seconds>.<micros>"`. Unique within a channel.
    pub ts: String,
    /// Parent message timestamp for thread replies.
    pub thread_ts: Option<String>,
    pub subtype: Option<String>,
    pub files: Vec<SlackFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SlackFile {
    pub id: String,
    pub name: Option<String>,
}

impl ConversationPayload for SlackMessage {
    const PLATFORM: Platform = Platform::Chat;

    fn normalize(&self) -> Result<CanonicalMessage, AdapterError> {
        if self.channel.is_empty() {
            return Err(AdapterError::malformed(Platform::Chat, "message has no channel"));
        }
        let timestamp = parse_ts(&self.ts).ok_or_else(|| {
            AdapterError::malformed(Platform::Chat, format!("unparseable ts {:?}", self.ts))
        })?;

        let sender = self
            .user
            .as_deref()
            .or(self.bot_id.as_deref())
            .unwrap_or_default();

        let thread = match &self.thread_ts {
            Some(parent) if *parent != self.ts => vec![parent.clone()],
            _ => Vec::new(),
        };

        let attachments = self
            .files
            .iter()
            .map(|f| f.name.clone().unwrap_or_else(|| f.id.clone()))
            .collect();

        Ok(CanonicalMessage::new(
            Platform::Chat,
            format!("{}:{}", self.channel, self.ts),
            sender,
            self.text.clone(),
            timestamp,
            classify(&self.text, sender),
        )
        .with_thread(thread)
        .with_attachments(attachments))
    }
}

/// Parse a Slack `ts` such as `1700000000.000100`.
pub fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, ""));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<6}").get(..6)?.parse().ok()?
    };
    DateTime::from_timestamp(secs, micros * 1_000)
}
