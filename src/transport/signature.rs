//! Webhook request signatures.
//!
//! Slack signs `v0:{timestamp}:{raw body}` with HMAC-SHA256 under the app's
//! signing secret. Twilio signs the public webhook URL followed by every form
//! parameter (sorted, `key` then `value`, no separators) with HMAC-SHA1 under
//! the account auth token. Both checks run as axum middleware in front of the
//! event handlers; a request that fails is answered with 401 and never
//! reaches the hub.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;
use sha2::Sha256;
use tracing::warn;

pub const SLACK_SIGNATURE_HEADER: &str = "x-slack-signature";
pub const SLACK_TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
pub const TWILIO_SIGNATURE_HEADER: &str = "x-twilio-signature";

/// Accepted clock skew for a Slack request timestamp.
pub const SLACK_REPLAY_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Largest webhook body read for verification.
const MAX_BODY_BYTES: usize = 1024 * 1024;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing or unreadable {0} header")]
    MissingHeader(&'static str),

    #[error("request timestamp outside the replay window")]
    Stale,

    #[error("signature does not match")]
    Mismatch,

    #[error("signing key rejected")]
    InvalidKey,
}

// ── Slack ───────────────────────────────────────────────────────────

/// Verifies Slack Events API requests.
pub struct SlackVerifier {
    signing_secret: SecretString,
    replay_window: Duration,
}

impl SlackVerifier {
    pub fn new(signing_secret: SecretString) -> Self {
        Self {
            signing_secret,
            replay_window: SLACK_REPLAY_WINDOW,
        }
    }

    /// Check `signature` (`v0=<hex>`) for `body` sent at `timestamp`, given
    /// the current time `now` in epoch seconds.
    pub fn verify(&self, timestamp: &str, signature: &str, body: &[u8], now: i64) -> Result<(), SignatureError> {
        let sent: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| SignatureError::MissingHeader(SLACK_TIMESTAMP_HEADER))?;
        if now.abs_diff(sent) > self.replay_window.as_secs() {
            return Err(SignatureError::Stale);
        }

        let expected = signature
            .strip_prefix("v0=")
            .and_then(|hex_sig| hex::decode(hex_sig).ok())
            .ok_or(SignatureError::Mismatch)?;
        slack_mac(self.signing_secret.expose_secret(), timestamp, body)?
            .verify_slice(&expected)
            .map_err(|_| SignatureError::Mismatch)
    }

    fn verify_request(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), SignatureError> {
        let timestamp = header(headers, SLACK_TIMESTAMP_HEADER)?;
        let signature = header(headers, SLACK_SIGNATURE_HEADER)?;
        self.verify(timestamp, signature, body, chrono::Utc::now().timestamp())
    }
}

fn slack_mac(secret: &str, timestamp: &str, body: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    Ok(mac)
}

/// The `X-Slack-Signature` value for `body` sent at `timestamp`.
pub fn slack_signature(secret: &str, timestamp: &str, body: &[u8]) -> Result<String, SignatureError> {
    let digest = slack_mac(secret, timestamp, body)?.finalize().into_bytes();
    Ok(format!("v0={}", hex::encode(digest)))
}

/// Middleware rejecting unsigned or mis-signed Slack requests.
pub async fn require_slack_signature(
    State(verifier): State<Arc<SlackVerifier>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match read_body(body).await {
        Ok(bytes) => bytes,
        Err(resp) => return resp,
    };
    if let Err(e) = verifier.verify_request(&parts.headers, &bytes) {
        warn!(error = %e, "Rejecting Slack webhook");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

// ── Twilio ──────────────────────────────────────────────────────────

/// Verifies Twilio webhook requests.
pub struct TwilioVerifier {
    auth_token: SecretString,
    /// Public URL Twilio posts to, exactly as configured in the console.
    url: String,
}

impl TwilioVerifier {
    pub fn new(auth_token: SecretString, url: impl Into<String>) -> Self {
        Self {
            auth_token,
            url: url.into(),
        }
    }

    /// Check `signature` (base64) for a form-encoded `body`.
    pub fn verify(&self, signature: &str, body: &[u8]) -> Result<(), SignatureError> {
        let expected = STANDARD
            .decode(signature.trim())
            .map_err(|_| SignatureError::Mismatch)?;
        let params: Vec<(String, String)> = url::form_urlencoded::parse(body).into_owned().collect();
        twilio_mac(self.auth_token.expose_secret(), &self.url, params)?
            .verify_slice(&expected)
            .map_err(|_| SignatureError::Mismatch)
    }

    fn verify_request(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), SignatureError> {
        self.verify(header(headers, TWILIO_SIGNATURE_HEADER)?, body)
    }
}

fn twilio_mac(auth_token: &str, url: &str, mut params: Vec<(String, String)>) -> Result<HmacSha1, SignatureError> {
    params.sort();
    let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes()).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(url.as_bytes());
    for (key, value) in &params {
        mac.update(key.as_bytes());
        mac.update(value.as_bytes());
    }
    Ok(mac)
}

/// The `X-Twilio-Signature` value for a form post of `params` to `url`.
pub fn twilio_signature(auth_token: &str, url: &str, params: &[(&str, &str)]) -> Result<String, SignatureError> {
    let params = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Ok(STANDARD.encode(twilio_mac(auth_token, url, params)?.finalize().into_bytes()))
}

/// Middleware rejecting unsigned or mis-signed Twilio requests.
pub async fn require_twilio_signature(
    State(verifier): State<Arc<TwilioVerifier>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match read_body(body).await {
        Ok(bytes) => bytes,
        Err(resp) => return resp,
    };
    if let Err(e) = verifier.verify_request(&parts.headers, &bytes) {
        warn!(error = %e, "Rejecting Twilio webhook");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

// ── Shared ──────────────────────────────────────────────────────────

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or(SignatureError::MissingHeader(name))
}

async fn read_body(body: Body) -> Result<Bytes, Response> {
    axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| StatusCode::PAYLOAD_TOO_LARGE.into_response())
}
