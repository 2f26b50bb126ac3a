use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::database::{Database, ProcessedEmailRecord, SentMessageRecord};
use crate::settings::Settings;
use crate::telegram::{ChatApi, ParseMode, TelegramError};

use super::common::{ParsedEmail, RelayStats};

/// Characters MarkdownV2 treats as markup; each must be backslash-escaped.
const MARKDOWN_V2_SPECIAL: &[char] = &[
    '\\', '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    /// Delivered. `recorded` is false when the ledger write failed afterwards;
    /// the message then escapes the retention sweep.
    Sent {
        telegram_message_id: i64,
        plain_fallback: bool,
        recorded: bool,
    },
    SkippedByFilter,
    Duplicate,
    /// Dry run: formatted and logged, nothing sent or recorded.
    DryRun,
    /// Both the formatted and the plain send failed. Nothing was recorded.
    Failed { reason: String },
}

impl RelayOutcome {
    /// Only an undelivered email is worth another attempt. Anything that
    /// reached the chat must never be sent again.
    pub fn needs_retry(&self) -> bool {
        matches!(self, RelayOutcome::Failed { .. })
    }
}

impl RelayStats {
    pub fn record(&mut self, outcome: &RelayOutcome) {
        match outcome {
            RelayOutcome::Sent { .. } | RelayOutcome::DryRun => self.sent += 1,
            RelayOutcome::SkippedByFilter => self.skipped += 1,
            RelayOutcome::Duplicate => self.duplicates += 1,
            RelayOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// True when `subject` passes `filter`: case-insensitive substring, empty filter passes all.
pub fn matches_filter(subject: &str, filter: &str) -> bool {
    let filter = filter.trim();
    if filter.is_empty() {
        return true;
    }
    subject.to_lowercase().contains(&filter.to_lowercase())
}

pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + text.len() / 4);
    for c in text.chars() {
        if MARKDOWN_V2_SPECIAL.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub fn format_markdown(email: &ParsedEmail) -> String {
    format!(
        "📧 *New Email*\n\n*From:* {}\n*Subject:* {}\n\n{}",
        escape_markdown(&email.from),
        escape_markdown(&email.subject),
        escape_markdown(email.body_preview())
    )
}

pub fn format_plain(email: &ParsedEmail) -> String {
    format!(
        "📧 New Email\n\nFrom: {}\nSubject: {}\n\n{}",
        email.from,
        email.subject,
        email.body_preview()
    )
}

/// Turns parsed emails into Telegram messages and keeps the ledger in step.
pub struct Relay {
    chat: Arc<dyn ChatApi>,
    database: Database,
    dry_run: bool,
}

impl Relay {
    pub fn new(chat: Arc<dyn ChatApi>, database: Database) -> Self {
        Relay {
            chat,
            database,
            dry_run: false,
        }
    }

    pub fn new_dry_run(chat: Arc<dyn ChatApi>, database: Database) -> Self {
        info!("🧪 Relay in dry-run mode (nothing is sent to Telegram)");
        Relay {
            chat,
            database,
            dry_run: true,
        }
    }

    /// Replaces the chat client, e.g. after the bot token changed.
    pub fn set_chat(&mut self, chat: Arc<dyn ChatApi>) {
        self.chat = chat;
    }

    pub async fn relay(&self, email: &ParsedEmail, settings: &Settings) -> Result<RelayOutcome> {
        self.relay_at(email, settings, Utc::now()).await
    }

    pub async fn relay_at(
        &self,
        email: &ParsedEmail,
        settings: &Settings,
        now: DateTime<Utc>,
    ) -> Result<RelayOutcome> {
        if !matches_filter(&email.subject, settings.subject_filter()) {
            info!(
                "⏭️ Skipped (filter \"{}\"): {}",
                settings.subject_filter(),
                email.subject
            );
            return Ok(RelayOutcome::SkippedByFilter);
        }

        if self.database.is_processed(&email.message_id).await? {
            debug!("Email {} already relayed, skipping", email.message_id);
            return Ok(RelayOutcome::Duplicate);
        }

        let chat_id = settings
            .owner_chat_id()
            .context("Cannot relay without a valid owner chat id")?;

        if self.dry_run {
            println!("{}", "-".repeat(60));
            println!("📧 Would relay to chat {}:", chat_id);
            println!("{}", format_plain(email));
            return Ok(RelayOutcome::DryRun);
        }

        info!("📧 Relaying email: {}", email.subject);

        let (telegram_message_id, plain_fallback) = match self.send(chat_id, email).await {
            Ok(sent) => sent,
            Err(e) => {
                error!("❌ Failed to relay email {}: {}", email.message_id, e);
                return Ok(RelayOutcome::Failed {
                    reason: e.to_string(),
                });
            }
        };

        info!(
            "✅ Email sent to Telegram{}: {}",
            if plain_fallback { " (plain)" } else { "" },
            email.subject
        );

        let recorded = match self.record(email, chat_id, telegram_message_id, now).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "❌ Email {} delivered as message {} but not recorded: {:#}",
                    email.message_id, telegram_message_id, e
                );
                false
            }
        };

        Ok(RelayOutcome::Sent {
            telegram_message_id,
            plain_fallback,
            recorded,
        })
    }

    async fn record(
        &self,
        email: &ParsedEmail,
        chat_id: i64,
        telegram_message_id: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.database
            .record_sent(&SentMessageRecord {
                telegram_message_id,
                chat_id,
                sent_at: now,
            })
            .await?;

        self.database
            .record_processed(&ProcessedEmailRecord {
                message_id: email.message_id.clone(),
                subject: email.subject.clone(),
                sender: email.from.clone(),
                processed_at: now,
            })
            .await?;
        Ok(())
    }

    /// MarkdownV2 first; if Telegram rejects it, one plain-text retry.
    async fn send(&self, chat_id: i64, email: &ParsedEmail) -> Result<(i64, bool), TelegramError> {
        let formatted = format_markdown(email);
        match self
            .chat
            .send_message(chat_id, &formatted, Some(ParseMode::MarkdownV2))
            .await
        {
            Ok(id) => Ok((id, false)),
            Err(e @ TelegramError::Http(_)) => Err(e),
            Err(e) => {
                if e.is_formatting() {
                    warn!("⚠️ Telegram rejected MarkdownV2, retrying as plain text: {}", e);
                } else {
                    warn!("⚠️ Formatted send failed, retrying as plain text: {}", e);
                }
                let id = self
                    .chat
                    .send_message(chat_id, &format_plain(email), None)
                    .await?;
                Ok((id, true))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_undelivered_emails_are_retried() {
        assert!(RelayOutcome::Failed { reason: "timeout".into() }.needs_retry());
        assert!(!RelayOutcome::Sent {
            telegram_message_id: 1,
            plain_fallback: false,
            recorded: false,
        }
        .needs_retry());
        assert!(!RelayOutcome::Duplicate.needs_retry());
        assert!(!RelayOutcome::SkippedByFilter.needs_retry());
    }

    #[test]
    fn test_filter_scenarios() {
        assert!(matches_filter("Your OTP is 1234", "OTP"));
        assert!(matches_filter("your otp is 1234", "OTP"));
        assert!(matches_filter("Your OTP is 1234", "  otp "));
        assert!(!matches_filter("Welcome", "OTP"));
        assert!(matches_filter("Welcome", ""));
        assert!(matches_filter("Welcome", "   "));
    }

    #[test]
    fn test_escape_every_special_character() {
        let raw = "_*[]()~`>#+-=|{}.!\\";
        let escaped = escape_markdown(raw);
        let mut chars = escaped.chars();
        while let Some(c) = chars.next() {
            assert_eq!(c, '\\', "unescaped character in {}", escaped);
            let next = chars.next().unwrap();
            assert!(MARKDOWN_V2_SPECIAL.contains(&next));
        }
        assert_eq!(escape_markdown("plain text 123"), "plain text 123");
    }

    #[test]
    fn test_format_markdown_escapes_fields() {
        let email = ParsedEmail {
            from: "no-reply@bank.example".into(),
            subject: "Code (valid 5 min).".into(),
            body_text: "Use 1234!".into(),
            message_id: "id".into(),
        };
        let text = format_markdown(&email);
        assert!(text.contains("no\\-reply@bank\\.example"));
        assert!(text.contains("Code \\(valid 5 min\\)\\."));
        assert!(text.ends_with("Use 1234\\!"));
        assert!(format_plain(&email).contains("Code (valid 5 min)."));
    }
}
