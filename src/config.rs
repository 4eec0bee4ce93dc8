//! Configuration types, built from environment variables.
//!
//! Each platform section is optional: when its primary variable is absent
//! the platform is disabled.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

pub const DEFAULT_GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
pub const DEFAULT_SLACK_API_BASE: &str = "https://slack.com/api";
pub const DEFAULT_TWILIO_API_BASE: &str = "https://conversations.twilio.com/v1";

/// Gmail REST settings. Enabled by `GMAIL_ACCESS_TOKEN`.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub access_token: SecretString,
    /// Envelope `From` for outbound mail.
    pub from_address: String,
    pub api_base: String,
}

impl GmailConfig {
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Result<Option<Self>, ConfigError> {
        let Some(token) = get("GMAIL_ACCESS_TOKEN") else {
            return Ok(None);
        };
        let from_address = get("GMAIL_FROM_ADDRESS").ok_or_else(|| ConfigError::MissingRequired {
            key: "GMAIL_FROM_ADDRESS".into(),
            hint: "Set it to the mailbox address that owns GMAIL_ACCESS_TOKEN".into(),
        })?;

        Ok(Some(Self {
            access_token: SecretString::from(token),
            from_address,
            api_base: get("GMAIL_API_BASE").unwrap_or_else(|| DEFAULT_GMAIL_API_BASE.to_string()),
        }))
    }
}

/// Slack Web API settings. Enabled by `SLACK_BOT_TOKEN`.
#[derive(Debug, Clone)]
pub struct SlackConfig {
    pub bot_token: SecretString,
    /// Key for `X-Slack-Signature` on Events API requests.
    pub signing_secret: SecretString,
    pub api_base: String,
}

impl SlackConfig {
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Result<Option<Self>, ConfigError> {
        let Some(bot_token) = get("SLACK_BOT_TOKEN") else {
            return Ok(None);
        };
        let signing_secret = get("SLACK_SIGNING_SECRET").ok_or_else(|| ConfigError::MissingRequired {
            key: "SLACK_SIGNING_SECRET".into(),
            hint: "Copy it from the Slack app's Basic Information page".into(),
        })?;

        Ok(Some(Self {
            bot_token: SecretString::from(bot_token),
            signing_secret: SecretString::from(signing_secret),
            api_base: get("SLACK_API_BASE").unwrap_or_else(|| DEFAULT_SLACK_API_BASE.to_string()),
        }))
    }
}

/// Twilio Conversations settings. Enabled by `TWILIO_ACCOUNT_SID`.
#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    /// Author identity used for outbound messages.
    pub identity: String,
    /// Proxy address (e.g. `whatsapp:+15550100`) for participants added to
    /// new conversations. Without it, new conversations have no SMS/WhatsApp
    /// participant.
    pub proxy_address: Option<String>,
    /// Public URL of `POST /twilio/events`, as configured on the Twilio
    /// service. Request signatures are computed over it.
    pub webhook_url: String,
    pub api_base: String,
}

impl TwilioConfig {
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Result<Option<Self>, ConfigError> {
        let Some(account_sid) = get("TWILIO_ACCOUNT_SID") else {
            return Ok(None);
        };
        let auth_token = get("TWILIO_AUTH_TOKEN")
            .ok_or_else(|| ConfigError::MissingEnvVar("TWILIO_AUTH_TOKEN".into()))?;
        let webhook_url = get("TWILIO_WEBHOOK_URL").ok_or_else(|| ConfigError::MissingRequired {
            key: "TWILIO_WEBHOOK_URL".into(),
            hint: "Set it to the public URL Twilio posts events to, e.g. https://host/twilio/events".into(),
        })?;

        Ok(Some(Self {
            account_sid,
            auth_token: SecretString::from(auth_token),
            identity: get("TWILIO_IDENTITY").unwrap_or_else(|| "unified-inbox".to_string()),
            proxy_address: get("TWILIO_PROXY_ADDRESS"),
            webhook_url,
            api_base: get("TWILIO_API_BASE").unwrap_or_else(|| DEFAULT_TWILIO_API_BASE.to_string()),
        }))
    }
}

/// Timing and serving settings shared by all adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Pull discipline cadence.
    pub poll_interval: Duration,
    /// Initialization deadline.
    pub connect_timeout: Duration,
    /// Per-request HTTP deadline.
    pub request_timeout: Duration,
    /// Port for push webhooks.
    pub webhook_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            webhook_port: 8080,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval: secs(get, "INBOX_POLL_INTERVAL_SECS", defaults.poll_interval)?,
            connect_timeout: secs(get, "INBOX_CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?,
            request_timeout: secs(get, "INBOX_REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            webhook_port: parsed(get, "INBOX_WEBHOOK_PORT", defaults.webhook_port)?,
        })
    }
}

/// Complete process configuration.
#[derive(Debug, Clone)]
pub struct InboxConfig {
    pub gmail: Option<GmailConfig>,
    pub slack: Option<SlackConfig>,
    pub twilio: Option<TwilioConfig>,
    pub sync: SyncConfig,
    /// Directory for the daily rolling log file, if any.
    pub log_dir: Option<PathBuf>,
}

impl InboxConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup)
    }

    fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            gmail: GmailConfig::from_lookup(get)?,
            slack: SlackConfig::from_lookup(get)?,
            twilio: TwilioConfig::from_lookup(get)?,
            sync: SyncConfig::from_lookup(get)?,
            log_dir: get("INBOX_LOG_DIR").map(PathBuf::from),
        })
    }

    /// True when no platform is configured.
    pub fn is_empty(&self) -> bool {
        self.gmail.is_none() && self.slack.is_none() && self.twilio.is_none()
    }
}

/// Non-empty, trimmed value of an environment variable.
fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T>(get: &dyn Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}

fn secs(get: &dyn Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let value: u64 = parsed(get, key, default.as_secs())?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be at least 1 second".into(),
        });
    }
    Ok(Duration::from_secs(value))
}
