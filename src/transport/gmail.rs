//! Gmail REST transport (`users.messages.*`).

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::adapters::email::{GmailMessage, MailTransport};
use crate::config::GmailConfig;
use crate::error::AdapterError;
use crate::model::Platform;
use crate::transport::{check_status, read_json, request_error};

/// Upper bound on pages followed per unread listing.
const MAX_LIST_PAGES: usize = 10;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ListResponse {
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

pub struct GmailApi {
    client: reqwest::Client,
    access_token: SecretString,
    api_base: String,
    timeout: Duration,
}

impl GmailApi {
    pub fn new(client: reqwest::Client, config: &GmailConfig, timeout: Duration) -> Self {
        Self {
            client,
            access_token: config.access_token.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{path}", self.api_base)
    }

    async fn get(&self, operation: &str, path: &str, query: &[(&str, &str)]) -> Result<reqwest::Response, AdapterError> {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(self.access_token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|e| request_error(Platform::Email, operation, self.timeout, e))?;
        check_status(Platform::Email, operation, resp).await
    }
}

#[async_trait]
impl MailTransport for GmailApi {
    async fn authenticate(&self) -> Result<(), AdapterError> {
        self.get("profile", "profile", &[]).await?;
        debug!("Gmail credential accepted");
        Ok(())
    }

    async fn list_unread(&self) -> Result<Vec<String>, AdapterError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let mut query = vec![("q", "is:unread")];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }
            let resp = self.get("messages.list", "messages", &query).await?;
            let page: ListResponse = read_json(Platform::Email, "messages.list", resp).await?;

            ids.extend(page.messages.into_iter().map(|m| m.id).filter(|id| !id.is_empty()));
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(ids)
    }

    async fn get_message(&self, id: &str) -> Result<GmailMessage, AdapterError> {
        let resp = self
            .get("messages.get", &format!("messages/{id}"), &[("format", "full")])
            .await?;
        read_json(Platform::Email, "messages.get", resp).await
    }

    async fn send_raw(&self, raw: &str) -> Result<String, AdapterError> {
        let resp = self
            .client
            .post(self.url("messages/send"))
            .bearer_auth(self.access_token.expose_secret())
            .json(&serde_json::json!({ "raw": raw }))
            .send()
            .await
            .map_err(|e| request_error(Platform::Email, "messages.send", self.timeout, e))?;
        let resp = check_status(Platform::Email, "messages.send", resp).await?;
        let sent: SendResponse = read_json(Platform::Email, "messages.send", resp).await?;
        Ok(sent.id)
    }
}
