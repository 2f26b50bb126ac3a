//! Operator commands received over Telegram.

use std::sync::OnceLock;

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use regex::Regex;

use crate::mail_watcher::WatcherState;
use crate::settings::secrets_match;
use crate::telegram::ParseMode;

pub const DENIED: &str = "❌ Only the owner can use this command.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Status,
    MyId,
    Reload,
    Update,
    Unknown(String),
}

impl Command {
    /// Parses `/name`, `/name@botname` and `/name args`. Non-commands yield `None`.
    pub fn parse(text: &str) -> Option<Command> {
        static COMMAND_RE: OnceLock<Regex> = OnceLock::new();
        let re = COMMAND_RE.get_or_init(|| {
            Regex::new(r"^/([A-Za-z0-9_]+)(?:@[A-Za-z0-9_]+)?(?:\s+.*)?$").expect("valid command regex")
        });

        let caps = re.captures(text.trim())?;
        let name = caps[1].to_lowercase();
        Some(match name.as_str() {
            "start" => Command::Start,
            "help" => Command::Help,
            "status" => Command::Status,
            "myid" | "id" => Command::MyId,
            "reload" => Command::Reload,
            "update" => Command::Update,
            _ => Command::Unknown(name),
        })
    }

    pub fn owner_only(&self) -> bool {
        matches!(self, Command::Status | Command::Reload | Command::Update)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub parse_mode: Option<ParseMode>,
}

impl Reply {
    fn plain(text: impl Into<String>) -> Self {
        Reply {
            text: text.into(),
            parse_mode: None,
        }
    }
}

/// What `/status` and `/start` report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub watcher: Option<WatcherState>,
    pub mail_user: String,
    pub email_filter: String,
    pub retention_days: i64,
    pub sent_messages: i64,
    pub processed_emails: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Mail credentials changed; the watcher was restarted.
    Restarted,
    /// Only non-mail settings changed.
    Swapped,
    /// `is_active` is off; the watcher was stopped.
    Deactivated,
}

/// Live state the commands read and mutate.
#[async_trait]
pub trait CommandContext: Send + Sync {
    /// The configured owner chat id, as stored in the settings.
    fn owner_id(&self) -> String;

    async fn status(&self) -> Result<StatusSnapshot>;

    async fn reload(&mut self) -> Result<ReloadOutcome>;

    /// Pulls new sources; returns the output to show the operator.
    async fn update(&mut self) -> Result<String>;
}

pub fn is_owner(owner_id: &str, chat_id: i64) -> bool {
    let owner_id = owner_id.trim();
    !owner_id.is_empty() && secrets_match(owner_id, &chat_id.to_string())
}

/// Answers one incoming message. `None` when it is not a command.
pub async fn dispatch<C: CommandContext>(ctx: &mut C, chat_id: i64, text: &str) -> Option<Reply> {
    let command = Command::parse(text)?;
    let owner = is_owner(&ctx.owner_id(), chat_id);

    if command.owner_only() && !owner {
        warn!("🚫 {:?} refused for chat {}", command, chat_id);
        return Some(Reply::plain(DENIED));
    }

    info!("💬 Command {:?} from chat {}", command, chat_id);

    let reply = match command {
        Command::Start | Command::Help => match ctx.status().await {
            Ok(status) => Reply::plain(welcome_text(&status, owner)),
            Err(e) => Reply::plain(format!("❌ {}", e)),
        },
        Command::MyId => Reply {
            text: format!("🆔 Your chat ID: `{}`", chat_id),
            parse_mode: Some(ParseMode::Markdown),
        },
        Command::Status => match ctx.status().await {
            Ok(status) => Reply::plain(status_text(&status)),
            Err(e) => Reply::plain(format!("❌ Status unavailable: {}", e)),
        },
        Command::Reload => match ctx.reload().await {
            Ok(ReloadOutcome::Restarted) => Reply::plain("✅ Settings reloaded, mail connection restarted."),
            Ok(ReloadOutcome::Swapped) => Reply::plain("✅ Settings reloaded!"),
            Ok(ReloadOutcome::Deactivated) => {
                Reply::plain("⏸️ Settings reloaded. The bot is disabled, mail watching stopped.")
            }
            Err(e) => Reply::plain(format!("❌ Failed to reload settings: {}", e)),
        },
        Command::Update => match ctx.update().await {
            Ok(output) => Reply::plain(format!("✅ Update pulled:\n{}\n\n🔄 Restarting...", output)),
            Err(e) => Reply::plain(format!("❌ Update failed: {}", e)),
        },
        Command::Unknown(name) => Reply::plain(format!("❓ Unknown command /{}. Try /help", name)),
    };
    Some(reply)
}

fn display_filter(filter: &str) -> &str {
    if filter.trim().is_empty() {
        "All emails"
    } else {
        filter.trim()
    }
}

fn welcome_text(status: &StatusSnapshot, owner: bool) -> String {
    let mut text = String::from("👋 Email relay bot is running!\n\n");
    if owner {
        text.push_str(&format!("📧 Email: {}\n", status.mail_user));
    }
    text.push_str(&format!(
        "🔍 Filter: {}\n🗑️ Auto-delete: {} days\n\n\
         Commands:\n\
         /status - Check status\n\
         /myid - Show your chat ID\n\
         /reload - Reload settings\n\
         /update - Update the bot",
        display_filter(&status.email_filter),
        status.retention_days
    ));
    text
}

fn status_text(status: &StatusSnapshot) -> String {
    let watcher = status
        .watcher
        .as_ref()
        .map(|state| state.to_string())
        .unwrap_or_else(|| "not running".to_string());
    let icon = if status.watcher == Some(WatcherState::Listening) {
        "✅"
    } else {
        "⚠️"
    };

    format!(
        "{} Bot alive, mail watcher {}\n\
         📧 Monitoring: {}\n\
         🔍 Filter: {}\n\
         📊 Stored messages: {}\n\
         📨 Processed emails: {}",
        icon,
        watcher,
        status.mail_user,
        display_filter(&status.email_filter),
        status.sent_messages,
        status.processed_emails
    )
}
