//! Network transports behind the adapters.
//!
//! Pull transports are plain REST clients. Push transports combine a REST
//! client for outbound calls with a webhook router that feeds a
//! [`webhook::WebhookHub`].

pub mod gmail;
pub mod signature;
pub mod slack;
pub mod twilio;
pub mod webhook;

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::AdapterError;
use crate::model::Platform;

pub use gmail::GmailApi;
pub use slack::SlackApi;
pub use twilio::TwilioConversationsApi;
pub use webhook::WebhookHub;

/// Shared HTTP client with a per-request deadline.
pub fn http_client(request_timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(request_timeout)
        .user_agent(concat!("unified-inbox/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Classify a failed request.
pub(crate) fn request_error(
    platform: Platform,
    operation: &str,
    timeout: Duration,
    e: reqwest::Error,
) -> AdapterError {
    if e.is_timeout() {
        AdapterError::TransportTimeout {
            platform,
            operation: operation.to_string(),
            timeout,
        }
    } else {
        AdapterError::transport(platform, format!("{operation}: {e}"))
    }
}

/// Error reasons that mean "slow down" rather than "credential rejected".
const THROTTLE_REASONS: &[&str] = &[
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "dailyLimitExceeded",
    "quotaExceeded",
];

/// Google-style error body: `{"error": {"status": .., "errors": [{"domain", "reason"}]}}`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorDetail {
    status: String,
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorItem {
    domain: String,
    reason: String,
}

fn is_throttled(body: &str) -> bool {
    let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) else {
        return false;
    };
    parsed.error.status == "RESOURCE_EXHAUSTED"
        || parsed
            .error
            .errors
            .iter()
            .any(|e| e.domain == "usageLimits" || THROTTLE_REASONS.contains(&e.reason.as_str()))
}

/// Map a non-success response to an error.
///
/// 401 is a rejected credential. 403 is too, unless the body reports a usage
/// limit; throttling (and 429) is a retryable transport error.
pub(crate) fn classify_failure(
    platform: Platform,
    operation: &str,
    status: StatusCode,
    body: &str,
) -> AdapterError {
    let excerpt: String = body.chars().take(200).collect();
    let throttled = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && is_throttled(body));

    if throttled {
        AdapterError::transport(platform, format!("{operation} throttled ({status}): {excerpt}"))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        AdapterError::declined(platform, format!("{operation} returned {status}"))
    } else {
        AdapterError::transport(platform, format!("{operation} returned {status}: {excerpt}"))
    }
}

/// Pass through a success response; map anything else to an error.
pub(crate) async fn check_status(
    platform: Platform,
    operation: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, AdapterError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(classify_failure(platform, operation, status, &body))
}

/// Decode a JSON response body.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    platform: Platform,
    operation: &str,
    resp: reqwest::Response,
) -> Result<T, AdapterError> {
    resp.json()
        .await
        .map_err(|e| AdapterError::transport(platform, format!("{operation}: invalid response body: {e}")))
}
