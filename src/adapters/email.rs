//! Email adapter: pull discipline over a Gmail-shaped REST transport.
//!
//! Inbound: list the unread ids, fetch each message in full, normalize.
//! Outbound: build an RFC 5322 message with lettre and hand the transport
//! its unpadded base64url encoding.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, TimeZone, Utc};
use lettre::Message;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::adapters::PlatformDriver;
use crate::classifier::classify;
use crate::error::AdapterError;
use crate::model::{CanonicalMessage, OutgoingMessage, Platform};
use crate::sync::{Normalize, PullSource, SyncEngine, SyncExit};

/// Reference poll cadence.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Gmail body data is base64url; padding may or may not be present.
const BODY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

// ── Raw payload ─────────────────────────────────────────────────────

/// A message as returned by `users.messages.get?format=full`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GmailMessage {
    pub id: String,
    pub thread_id: String,
    pub label_ids: Vec<String>,
    /// Epoch milliseconds, as a decimal string.
    pub internal_date: Option<String>,
    pub payload: MessagePart,
}

/// One node of the MIME part tree.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagePart {
    pub part_id: String,
    pub mime_type: String,
    pub filename: String,
    pub headers: Vec<Header>,
    pub body: PartBody,
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartBody {
    pub attachment_id: Option<String>,
    pub size: u64,
    pub data: Option<String>,
}

impl MessagePart {
    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    fn is_leaf(&self) -> bool {
        self.parts.is_empty()
    }

    fn is_attachment(&self) -> bool {
        !self.filename.is_empty()
    }
}

// ── Transport ───────────────────────────────────────────────────────

/// Mailbox operations the email adapter needs.
#[async_trait]
pub trait MailTransport: Send + Sync + 'static {
    /// Verify the credential. A rejected credential is `AuthenticationDeclined`.
    async fn authenticate(&self) -> Result<(), AdapterError>;

    /// Ids of the current unread set, in transport order.
    async fn list_unread(&self) -> Result<Vec<String>, AdapterError>;

    async fn get_message(&self, id: &str) -> Result<GmailMessage, AdapterError>;

    /// Submit an encoded envelope. Returns the new message id.
    async fn send_raw(&self, raw: &str) -> Result<String, AdapterError>;
}

// ── Driver ──────────────────────────────────────────────────────────

pub struct EmailDriver<T> {
    transport: T,
    from_address: String,
    poll_interval: Duration,
}

impl<T: MailTransport> EmailDriver<T> {
    pub fn new(transport: T, from_address: impl Into<String>) -> Self {
        Self {
            transport,
            from_address: from_address.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: MailTransport> Normalize for EmailDriver<T> {
    type Raw = GmailMessage;

    fn platform(&self) -> Platform {
        Platform::Email
    }

    fn normalize(&self, raw: &GmailMessage) -> Result<CanonicalMessage, AdapterError> {
        normalize_email(raw)
    }
}

#[async_trait]
impl<T: MailTransport> PullSource for EmailDriver<T> {
    async fn fetch_unread(&self, engine: &SyncEngine) -> Result<Vec<GmailMessage>, AdapterError> {
        let ids = self.transport.list_unread().await?;
        let mut messages = Vec::new();
        for id in ids.iter().filter(|id| !engine.has_seen(id)) {
            match self.transport.get_message(id).await {
                Ok(message) => messages.push(message),
                Err(e) => warn!(id = %id, error = %e, "Skipping email that failed to fetch"),
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl<T: MailTransport> PlatformDriver for EmailDriver<T> {
    async fn authenticate(&self) -> Result<(), AdapterError> {
        self.transport.authenticate().await
    }

    async fn start_sync(
        driver: Arc<Self>,
        engine: Arc<SyncEngine>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<SyncExit>, AdapterError> {
        let interval = driver.poll_interval;
        Ok(engine.spawn_pull(driver, interval, shutdown))
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<String, AdapterError> {
        let raw = build_raw_envelope(
            &self.from_address,
            &message.recipient,
            message.subject.as_deref().unwrap_or_default(),
            &message.body,
        )?;
        self.transport.send_raw(&raw).await
    }
}

// ── Normalization ───────────────────────────────────────────────────

/// Convert a full Gmail message into a canonical message.
///
/// Only a missing id or an unusable timestamp fail; everything else degrades
/// to a default.
pub fn normalize_email(raw: &GmailMessage) -> Result<CanonicalMessage, AdapterError> {
    if raw.id.is_empty() {
        return Err(AdapterError::malformed(Platform::Email, "message has no id"));
    }

    let subject = raw.payload.header("Subject").unwrap_or_default();
    let from = raw.payload.header("From").unwrap_or_default();
    let timestamp = message_timestamp(raw).ok_or_else(|| {
        AdapterError::malformed(
            Platform::Email,
            format!("message {} has no usable Date header or internalDate", raw.id),
        )
    })?;

    let read = !raw.label_ids.iter().any(|l| l == "UNREAD");
    let labels = raw
        .label_ids
        .iter()
        .filter(|l| *l != "UNREAD")
        .map(|l| normalize_label(l))
        .collect();

    let mut attachments = Vec::new();
    collect_attachments(&raw.payload, &mut attachments);

    Ok(CanonicalMessage::new(
        Platform::Email,
        raw.id.clone(),
        from,
        decode_body(&raw.payload),
        timestamp,
        classify(subject, from),
    )
    .with_read(read)
    .with_attachments(attachments)
    .with_labels(labels))
}

/// `CATEGORY_PERSONAL` → `personal`, `IMPORTANT` → `important`.
fn normalize_label(label: &str) -> String {
    label
        .strip_prefix("CATEGORY_")
        .unwrap_or(label)
        .to_lowercase()
}

fn message_timestamp(raw: &GmailMessage) -> Option<DateTime<Utc>> {
    raw.payload
        .header("Date")
        .and_then(parse_date_header)
        .or_else(|| {
            let millis: i64 = raw.internal_date.as_deref()?.trim().parse().ok()?;
            Utc.timestamp_millis_opt(millis).single()
        })
}

fn parse_date_header(value: &str) -> Option<DateTime<Utc>> {
    // Drop a trailing zone comment such as " (UTC)".
    let value = match value.find(" (") {
        Some(pos) => &value[..pos],
        None => value,
    };
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn collect_attachments(part: &MessagePart, out: &mut Vec<String>) {
    if part.is_attachment() {
        out.push(part.filename.clone());
    }
    for child in &part.parts {
        collect_attachments(child, out);
    }
}

/// Plain-text body of a part tree.
///
/// Prefers the first decodable `text/plain` leaf, then the first decodable
/// `text/html` leaf rendered to text. Returns an empty string when no leaf
/// decodes.
pub fn decode_body(payload: &MessagePart) -> String {
    if let Some(text) = find_leaf(payload, "text/plain") {
        return text;
    }
    find_leaf(payload, "text/html")
        .map(|html| strip_html(&html))
        .unwrap_or_default()
}

fn find_leaf(part: &MessagePart, mime_type: &str) -> Option<String> {
    if part.is_leaf() {
        if part.is_attachment() || !part.mime_type.eq_ignore_ascii_case(mime_type) {
            return None;
        }
        let data = part.body.data.as_deref()?;
        return match BODY_ENGINE.decode(data.trim()) {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => {
                warn!(part = %part.part_id, error = %e, "Undecodable email body part");
                None
            }
        };
    }
    part.parts.iter().find_map(|child| find_leaf(child, mime_type))
}

/// Elements whose content is never rendered.
const HIDDEN_ELEMENTS: &[&str] = &["style", "script"];

/// Render HTML to collapsed plain text: tags dropped, `<style>` and
/// `<script>` content skipped, character references decoded.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut rest = html;
    let mut hidden: Option<&str> = None;

    while !rest.is_empty() {
        if let Some(element) = hidden.take() {
            // Content runs to the matching end tag.
            match rest.to_ascii_lowercase().find(&format!("</{element}")) {
                Some(pos) => rest = &rest[pos..],
                None => {
                    rest = "";
                    break;
                }
            }
        }
        let Some(open) = rest.find('<') else {
            break;
        };
        text.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('>') else {
            // Unterminated tag: drop the remainder.
            rest = "";
            break;
        };
        let tag = &after[..close];
        if !tag.starts_with('/') {
            let name: String = tag
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric())
                .collect();
            hidden = HIDDEN_ELEMENTS
                .iter()
                .copied()
                .find(|e| name.eq_ignore_ascii_case(e));
        }
        text.push(' ');
        rest = &after[close + 1..];
    }
    text.push_str(rest);

    decode_entities(&text)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decode named and numeric character references. Unknown ones are kept.
fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp + 1..];
        let decoded = tail
            .find(';')
            .filter(|&end| end <= 8)
            .and_then(|end| entity(&tail[..end]).map(|ch| (ch, end)));
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

fn entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let num = name.strip_prefix('#')?;
            let code = match num.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

// ── Outbound ────────────────────────────────────────────────────────

/// Build the envelope for `users.messages.send`: a plain-text RFC 5322
/// message, base64url-encoded with the trailing padding stripped.
pub fn build_raw_envelope(
    from: &str,
    to: &str,
    subject: &str,
    body: &str,
) -> Result<String, AdapterError> {
    let from: Mailbox = from
        .parse()
        .map_err(|e| AdapterError::transport(Platform::Email, format!("Invalid from address: {e}")))?;
    let to: Mailbox = to
        .parse()
        .map_err(|e| AdapterError::transport(Platform::Email, format!("Invalid to address: {e}")))?;

    let email = Message::builder()
        .from(from)
        .to(to)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN)
        .body(body.to_string())
        .map_err(|e| AdapterError::transport(Platform::Email, format!("Failed to build email: {e}")))?;

    Ok(URL_SAFE_NO_PAD.encode(email.formatted()))
}
