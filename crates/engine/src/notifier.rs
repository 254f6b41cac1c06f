//! Outbound user notifications.
//!
//! The engine only needs text (optionally with inline buttons) and photo
//! delivery. [`BotApiNotifier`] talks to a chat Bot API over HTTPS;
//! [`LogNotifier`] is used when no bot token is configured.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use handle_watch_domain::UserId;
use reqwest::{multipart, Client};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::client::build_client;

pub const DEFAULT_BOT_API_BASE: &str = "https://api.telegram.org";
pub const SHOW_INACTIVE_ACCOUNTS: &str = "show_inactive_accounts";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("bot api rejected the request: {0}")]
    Rejected(String),
    #[error("failed to read attachment: {0}")]
    Attachment(#[from] std::io::Error),
}

impl From<reqwest::Error> for NotifyError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

/// Delivery capability consumed by the scheduler and the deadline job.
/// Implementations must tolerate concurrent calls.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_text(
        &self,
        user: UserId,
        text: &str,
        buttons: &[InlineButton],
    ) -> Result<(), NotifyError>;

    async fn send_photo(&self, user: UserId, path: &Path, caption: &str)
        -> Result<(), NotifyError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_text(
        &self,
        user: UserId,
        text: &str,
        buttons: &[InlineButton],
    ) -> Result<(), NotifyError> {
        info!(user_id = %user, buttons = buttons.len(), text, "notification");
        Ok(())
    }

    async fn send_photo(
        &self,
        user: UserId,
        path: &Path,
        caption: &str,
    ) -> Result<(), NotifyError> {
        info!(user_id = %user, path = %path.display(), caption, "photo notification");
        Ok(())
    }
}

pub struct BotApiNotifier {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct BotApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl BotApiNotifier {
    pub fn new(token: impl Into<String>) -> Result<Self, NotifyError> {
        Self::with_base_url(token, DEFAULT_BOT_API_BASE)
    }

    pub fn with_base_url(
        token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, NotifyError> {
        Ok(Self {
            client: build_client(Duration::from_secs(30))?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    async fn check(response: reqwest::Response) -> Result<(), NotifyError> {
        let status = response.status();
        let body: BotApiResponse = response
            .json()
            .await
            .map_err(|err| NotifyError::Rejected(format!("{status}: {err}")))?;
        if body.ok {
            Ok(())
        } else {
            Err(NotifyError::Rejected(
                body.description.unwrap_or_else(|| status.to_string()),
            ))
        }
    }
}

/// Escapes text interpolated into an HTML-mode message. Quotes are escaped
/// too so the result is safe inside `href="..."`.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// One button per row, the layout used for account lists.
pub fn inline_keyboard(buttons: &[InlineButton]) -> serde_json::Value {
    let rows: Vec<Vec<&InlineButton>> = buttons.iter().map(|button| vec![button]).collect();
    json!({ "inline_keyboard": rows })
}

#[async_trait]
impl Notifier for BotApiNotifier {
    async fn send_text(
        &self,
        user: UserId,
        text: &str,
        buttons: &[InlineButton],
    ) -> Result<(), NotifyError> {
        let mut payload = json!({
            "chat_id": user.get(),
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        if !buttons.is_empty() {
            payload["reply_markup"] = inline_keyboard(buttons);
        }

        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&payload)
            .send()
            .await?;
        Self::check(response).await
    }

    async fn send_photo(
        &self,
        user: UserId,
        path: &Path,
        caption: &str,
    ) -> Result<(), NotifyError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact.png".to_string());
        let photo = multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("image/png")?;
        let form = multipart::Form::new()
            .text("chat_id", user.get().to_string())
            .text("caption", caption.to_string())
            .text("parse_mode", "HTML")
            .part("photo", photo);

        let response = self
            .client
            .post(self.method_url("sendPhoto"))
            .multipart(form)
            .send()
            .await?;
        Self::check(response).await
    }
}
