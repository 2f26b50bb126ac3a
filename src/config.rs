use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Process-level configuration, read from the environment (or `.env`).
///
/// Everything the operator edits at runtime (credentials, filter, ...)
/// lives in the settings file instead, see [`crate::settings`].
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub settings_path: PathBuf,
    pub database: DatabaseConfig,
    pub imap: ImapConfig,
    pub telegram: TelegramConfig,
    pub retention: RetentionConfig,
    /// Git checkout pulled by the `/update` command. `None` disables it.
    pub update_repo_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImapConfig {
    pub port: u16,
    pub mailbox: String,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub api_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    /// Age after which relayed Telegram messages are deleted.
    pub sent_message_days: i64,
    /// Age after which dedup entries are forgotten.
    pub processed_email_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            settings_path: PathBuf::from("./settings.json"),
            database: DatabaseConfig {
                url: "sqlite://mailrelay.db".to_string(),
            },
            imap: ImapConfig {
                port: 993,
                mailbox: "INBOX".to_string(),
                reconnect_delay: Duration::from_secs(5),
                connect_timeout: Duration::from_secs(30),
                idle_timeout: Duration::from_secs(20 * 60),
            },
            telegram: TelegramConfig {
                api_url: "https://api.telegram.org".to_string(),
            },
            retention: RetentionConfig {
                sent_message_days: 7,
                processed_email_days: 30,
            },
            update_repo_dir: None,
        }
    }
}

impl Config {
    pub fn new() -> Result<Self> {
        let defaults = Config::default();

        let config = Config {
            settings_path: std::env::var("SETTINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.settings_path),
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            imap: ImapConfig {
                port: env_parse("IMAP_PORT", defaults.imap.port)?,
                mailbox: std::env::var("IMAP_MAILBOX").unwrap_or(defaults.imap.mailbox),
                reconnect_delay: Duration::from_secs(env_parse("RECONNECT_DELAY_SECS", 5)?),
                connect_timeout: Duration::from_secs(env_parse("CONNECT_TIMEOUT_SECS", 30)?),
                idle_timeout: Duration::from_secs(env_parse::<u64>("IDLE_TIMEOUT_MINUTES", 20)? * 60),
            },
            telegram: TelegramConfig {
                api_url: std::env::var("TELEGRAM_API_URL")
                    .map(|url| url.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.telegram.api_url),
            },
            retention: RetentionConfig {
                sent_message_days: env_parse("RETENTION_DAYS", defaults.retention.sent_message_days)?,
                processed_email_days: env_parse(
                    "PROCESSED_RETENTION_DAYS",
                    defaults.retention.processed_email_days,
                )?,
            },
            update_repo_dir: std::env::var("UPDATE_REPO_DIR")
                .ok()
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
        };

        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.imap.connect_timeout.is_zero() {
            anyhow::bail!("CONNECT_TIMEOUT_SECS doit être supérieur à 0");
        }
        if self.imap.idle_timeout.is_zero() {
            anyhow::bail!("IDLE_TIMEOUT_MINUTES doit être supérieur à 0");
        }
        if self.retention.sent_message_days <= 0 || self.retention.processed_email_days <= 0 {
            anyhow::bail!(
                "Les durées de rétention doivent être positives\n\
                 \n\
                 💡 Vérifiez RETENTION_DAYS et PROCESSED_RETENTION_DAYS dans votre fichier .env"
            );
        }
        Ok(())
    }
}

/// Reads and parses an optional environment variable.
///
/// A variable that is set but unparsable is an error rather than a silent
/// fallback to the default.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("Valeur invalide pour {}: {}", name, raw)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.imap.port, 993);
        assert_eq!(config.imap.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.imap.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.retention.sent_message_days, 7);
        assert_eq!(config.retention.processed_email_days, 30);
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        std::env::set_var("MAILRELAY_TEST_BAD_PORT", "not-a-port");
        assert!(env_parse::<u16>("MAILRELAY_TEST_BAD_PORT", 993).is_err());
        std::env::remove_var("MAILRELAY_TEST_BAD_PORT");
        assert_eq!(env_parse::<u16>("MAILRELAY_TEST_BAD_PORT", 993).unwrap(), 993);
    }

    #[test]
    fn test_check_rejects_zero_retention() {
        let mut config = Config::default();
        config.retention.sent_message_days = 0;
        assert!(config.check().is_err());
    }
}
