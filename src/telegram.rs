//! Telegram Bot API client: the subset the relay needs.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, trace};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Long-poll timeout handed to `getUpdates`, in seconds.
pub const LONG_POLL_SECS: u64 = 30;

const NOT_FOUND_MARKER: &str = "message to delete not found";
const PARSE_ERROR_MARKER: &str = "can't parse entities";

#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("Telegram request failed: {0}")]
    Http(String),

    #[error("Telegram API error ({code:?}): {description}")]
    Api { code: Option<i64>, description: String },
}

impl TelegramError {
    /// The message is already gone; deleting it again is a no-op.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TelegramError::Api { description, .. }
            if description.to_lowercase().contains(NOT_FOUND_MARKER))
    }

    /// MarkdownV2 was rejected; the plain-text retry may still succeed.
    pub fn is_formatting(&self) -> bool {
        matches!(self, TelegramError::Api { description, .. }
            if description.to_lowercase().contains(PARSE_ERROR_MARKER))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParseMode {
    MarkdownV2,
    Markdown,
}

/// Sending and deleting chat messages.
///
/// The relay and the sweeper only need these two calls, which keeps them
/// testable without a live bot.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Sends `text` and returns the new message id.
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: Option<ParseMode>,
    ) -> Result<i64, TelegramError>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TelegramError>;
}

/// Wrapper for all Bot API responses: `{ ok, result?, description?, error_code? }`.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
}

impl<T> TelegramResponse<T> {
    fn into_result(self) -> Result<Option<T>, TelegramError> {
        if self.ok {
            Ok(self.result)
        } else {
            Err(TelegramError::Api {
                code: self.error_code,
                description: self.description.unwrap_or_else(|| "unknown error".into()),
            })
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<User>,
    pub chat: Chat,
    pub text: Option<String>,
    pub date: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<ParseMode>,
    disable_web_page_preview: bool,
}

#[derive(Debug, Serialize)]
struct DeleteMessageRequest {
    chat_id: i64,
    message_id: i64,
}

pub struct TelegramClient {
    http: Client,
    base_url: String,
}

impl TelegramClient {
    /// `api_url` is `https://api.telegram.org` unless overridden for tests.
    pub fn new(api_url: &str, token: &str) -> Result<Self, TelegramError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_SECS + 15))
            .build()
            .map_err(|e| TelegramError::Http(e.to_string()))?;

        Ok(TelegramClient {
            http,
            base_url: format!("{}/bot{}", api_url.trim_end_matches('/'), token),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call<B, T>(&self, method: &str, body: &B) -> Result<Option<T>, TelegramError>
    where
        B: Serialize + ?Sized,
        T: for<'de> Deserialize<'de>,
    {
        let url = format!("{}/{}", self.base_url, method);
        trace!("Telegram call {}", method);

        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| TelegramError::Http(e.without_url().to_string()))?;

        let body: TelegramResponse<T> = resp
            .json()
            .await
            .map_err(|e| TelegramError::Http(e.without_url().to_string()))?;

        body.into_result()
    }

    /// Verifies the bot token; returns the bot's own user.
    pub async fn get_me(&self) -> Result<User, TelegramError> {
        let me: Option<User> = self.call("getMe", &serde_json::json!({})).await?;
        let me = me.ok_or_else(|| TelegramError::Http("missing result in getMe response".into()))?;
        info!("🤖 Telegram bot authenticated as @{}", me.username.as_deref().unwrap_or(&me.first_name));
        Ok(me)
    }

    /// Long-polls for updates starting at `offset`.
    pub async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>, TelegramError> {
        let mut body = serde_json::json!({
            "timeout": LONG_POLL_SECS,
            "allowed_updates": ["message"],
        });
        if let Some(offset) = offset {
            body["offset"] = serde_json::json!(offset);
        }

        let updates: Option<Vec<Update>> = self.call("getUpdates", &body).await?;
        let updates = updates.unwrap_or_default();
        if !updates.is_empty() {
            debug!("Received {} Telegram update(s)", updates.len());
        }
        Ok(updates)
    }
}

#[async_trait]
impl ChatApi for TelegramClient {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: Option<ParseMode>,
    ) -> Result<i64, TelegramError> {
        let req = SendMessageRequest {
            chat_id,
            text,
            parse_mode,
            disable_web_page_preview: true,
        };
        let message: Option<Message> = self.call("sendMessage", &req).await?;
        message
            .map(|m| m.message_id)
            .ok_or_else(|| TelegramError::Http("missing result in sendMessage response".into()))
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TelegramError> {
        let req = DeleteMessageRequest { chat_id, message_id };
        let _: Option<bool> = self.call("deleteMessage", &req).await?;
        Ok(())
    }
}
