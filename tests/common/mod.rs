// Shared helpers for the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::sync::Mutex;

use async_trait::async_trait;
use mailrelay::database::Database;
use mailrelay::email::ParsedEmail;
use mailrelay::settings::Settings;
use mailrelay::telegram::{ChatApi, ParseMode, TelegramError};

pub const OWNER_CHAT_ID: i64 = 111;

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub chat_id: i64,
    pub text: String,
    pub parse_mode: Option<ParseMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteFailure {
    NotFound,
    Forbidden,
}

/// In-memory stand-in for the Telegram Bot API.
#[derive(Default)]
pub struct FakeChat {
    reject_markdown: bool,
    reject_plain: bool,
    delete_failures: HashMap<i64, DeleteFailure>,
    close_on_send: Option<Database>,
    sent: Mutex<Vec<SentMessage>>,
    deleted: Mutex<Vec<(i64, i64)>>,
    next_id: Mutex<i64>,
}

impl FakeChat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Telegram refuses MarkdownV2 but accepts plain text.
    pub fn rejecting_markdown(mut self) -> Self {
        self.reject_markdown = true;
        self
    }

    pub fn rejecting_everything(mut self) -> Self {
        self.reject_markdown = true;
        self.reject_plain = true;
        self
    }

    /// Delivers, but shuts the ledger down first so the follow-up write fails.
    pub fn closing_ledger_on_send(mut self, database: Database) -> Self {
        self.close_on_send = Some(database);
        self
    }

    pub fn failing_delete(mut self, message_id: i64, failure: DeleteFailure) -> Self {
        self.delete_failures.insert(message_id, failure);
        self
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<(i64, i64)> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatApi for FakeChat {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: Option<ParseMode>,
    ) -> Result<i64, TelegramError> {
        let rejected = match parse_mode {
            Some(_) => self.reject_markdown,
            None => self.reject_plain,
        };
        if rejected {
            return Err(TelegramError::Api {
                code: Some(400),
                description: "Bad Request: can't parse entities".to_string(),
            });
        }

        if let Some(database) = &self.close_on_send {
            database.clone().close().await.unwrap();
        }

        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        self.sent.lock().unwrap().push(SentMessage {
            chat_id,
            text: text.to_string(),
            parse_mode,
        });
        Ok(1000 + *next_id)
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), TelegramError> {
        match self.delete_failures.get(&message_id) {
            Some(DeleteFailure::NotFound) => Err(TelegramError::Api {
                code: Some(400),
                description: "Bad Request: message to delete not found".to_string(),
            }),
            Some(DeleteFailure::Forbidden) => Err(TelegramError::Api {
                code: Some(403),
                description: "Forbidden: bot was blocked by the user".to_string(),
            }),
            None => {
                self.deleted.lock().unwrap().push((chat_id, message_id));
                Ok(())
            }
        }
    }
}

pub fn owner_settings(filter: &str) -> Settings {
    Settings {
        telegram_bot_token: "123:ABC".to_string(),
        telegram_owner_id: OWNER_CHAT_ID.to_string(),
        mail_user: "me@outlook.com".to_string(),
        mail_password: "app-password".to_string(),
        email_filter: filter.to_string(),
        is_active: true,
        owner_secret: "s3cret".to_string(),
        ..Settings::default()
    }
}

pub fn load_email(name: &str) -> ParsedEmail {
    let raw = fs::read(format!("data_test/{}", name))
        .unwrap_or_else(|e| panic!("Failed to read test email data_test/{}: {}", name, e));
    ParsedEmail::parse(&raw)
}
