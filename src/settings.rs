//! File-backed bot settings, guarded by the owner secret.

use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DEFAULT_IMAP_HOST: &str = "imap-mail.outlook.com";
pub const DEFAULT_EMAIL_FILTER: &str = "OTP";
const MAX_POLL_INTERVAL_MINUTES: u32 = 24 * 60;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("missing required setting: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("settings file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Bot configuration as persisted in `settings.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub telegram_bot_token: String,
    pub telegram_owner_id: String,
    #[serde(alias = "outlook_email")]
    pub mail_user: String,
    #[serde(alias = "outlook_password")]
    pub mail_password: String,
    pub imap_host: String,
    pub polling_interval_minutes: u32,
    pub email_filter: String,
    pub is_active: bool,
    pub owner_secret: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            telegram_bot_token: String::new(),
            telegram_owner_id: String::new(),
            mail_user: String::new(),
            mail_password: String::new(),
            imap_host: DEFAULT_IMAP_HOST.to_string(),
            polling_interval_minutes: 1,
            email_filter: DEFAULT_EMAIL_FILTER.to_string(),
            is_active: false,
            owner_secret: String::new(),
        }
    }
}

impl Settings {
    /// Checks that everything the watcher and the relay need is present.
    ///
    /// Reports the first missing field so the operator knows what to fix.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let required = [
            ("telegram_bot_token", &self.telegram_bot_token),
            ("telegram_owner_id", &self.telegram_owner_id),
            ("mail_user", &self.mail_user),
            ("mail_password", &self.mail_password),
            ("imap_host", &self.imap_host),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(SettingsError::MissingField(name));
            }
        }
        self.owner_chat_id()?;
        Ok(())
    }

    /// The owner's Telegram chat id, which is also the relay destination.
    pub fn owner_chat_id(&self) -> Result<i64, SettingsError> {
        let raw = self.telegram_owner_id.trim();
        if raw.is_empty() {
            return Err(SettingsError::MissingField("telegram_owner_id"));
        }
        raw.parse().map_err(|_| SettingsError::InvalidField {
            field: "telegram_owner_id",
            reason: format!("'{}' is not a numeric chat id", raw),
        })
    }

    /// Filter text to match against subjects; empty means relay everything.
    pub fn subject_filter(&self) -> &str {
        self.email_filter.trim()
    }

    /// True when switching from `self` to `other` needs a new IMAP session.
    pub fn mail_credentials_differ(&self, other: &Settings) -> bool {
        self.mail_user != other.mail_user
            || self.mail_password != other.mail_password
            || self.imap_host.trim() != other.imap_host.trim()
    }

    pub fn masked(&self) -> MaskedSettings {
        MaskedSettings {
            telegram_bot_token: mask_token(&self.telegram_bot_token),
            telegram_owner_id: self.telegram_owner_id.clone(),
            mail_user: self.mail_user.clone(),
            mail_password: if self.mail_password.is_empty() {
                String::new()
            } else {
                "********".to_string()
            },
            imap_host: self.imap_host.clone(),
            polling_interval_minutes: self.polling_interval_minutes,
            email_filter: self.email_filter.clone(),
            is_active: self.is_active,
        }
    }
}

/// Settings as shown to an authenticated operator: secrets hidden.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaskedSettings {
    pub telegram_bot_token: String,
    pub telegram_owner_id: String,
    pub mail_user: String,
    pub mail_password: String,
    pub imap_host: String,
    pub polling_interval_minutes: u32,
    pub email_filter: String,
    pub is_active: bool,
}

fn mask_token(token: &str) -> String {
    if token.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = token.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(6)..].iter().collect();
    format!("***{}", tail)
}

/// Partial update: `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub telegram_bot_token: Option<String>,
    pub telegram_owner_id: Option<String>,
    pub mail_user: Option<String>,
    pub mail_password: Option<String>,
    pub imap_host: Option<String>,
    pub polling_interval_minutes: Option<u32>,
    pub email_filter: Option<String>,
    pub is_active: Option<bool>,
}

impl SettingsUpdate {
    fn check(&self) -> Result<(), SettingsError> {
        if let Some(owner_id) = &self.telegram_owner_id {
            let owner_id = owner_id.trim();
            if !owner_id.is_empty() && owner_id.parse::<i64>().is_err() {
                return Err(SettingsError::InvalidField {
                    field: "telegram_owner_id",
                    reason: format!("'{}' is not a numeric chat id", owner_id),
                });
            }
        }
        if let Some(minutes) = self.polling_interval_minutes {
            if minutes == 0 || minutes > MAX_POLL_INTERVAL_MINUTES {
                return Err(SettingsError::InvalidField {
                    field: "polling_interval_minutes",
                    reason: format!("must be between 1 and {}", MAX_POLL_INTERVAL_MINUTES),
                });
            }
        }
        if let Some(host) = &self.imap_host {
            if host.trim().is_empty() || host.trim().contains(char::is_whitespace) {
                return Err(SettingsError::InvalidField {
                    field: "imap_host",
                    reason: "must be a bare host name".to_string(),
                });
            }
        }
        Ok(())
    }

    fn apply(self, settings: &mut Settings) {
        // An empty token or password from the dashboard means "keep the current one".
        if let Some(token) = self.telegram_bot_token.filter(|t| !t.is_empty()) {
            settings.telegram_bot_token = token;
        }
        if let Some(password) = self.mail_password.filter(|p| !p.is_empty()) {
            settings.mail_password = password;
        }
        if let Some(owner_id) = self.telegram_owner_id {
            settings.telegram_owner_id = owner_id.trim().to_string();
        }
        if let Some(user) = self.mail_user {
            settings.mail_user = user.trim().to_string();
        }
        if let Some(host) = self.imap_host {
            settings.imap_host = host.trim().to_string();
        }
        if let Some(minutes) = self.polling_interval_minutes {
            settings.polling_interval_minutes = minutes;
        }
        if let Some(filter) = self.email_filter {
            settings.email_filter = filter;
        }
        if let Some(active) = self.is_active {
            settings.is_active = active;
        }
    }
}

/// JSON settings file plus the owner-secret gate in front of it.
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SettingsStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the settings file, creating it with defaults when missing.
    pub fn load(&self) -> Result<Settings, SettingsError> {
        if !self.path.exists() {
            let defaults = Settings::default();
            self.save(&defaults)?;
            warn!(
                "📄 Created {} with default settings - set owner_secret before using it",
                self.path.display()
            );
            return Ok(defaults);
        }

        let raw = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Returns the settings with secrets masked.
    pub fn get(&self, owner_secret: &str) -> Result<MaskedSettings, SettingsError> {
        let settings = self.load()?;
        authorize(&settings, owner_secret)?;
        Ok(settings.masked())
    }

    /// Applies a partial update and persists it.
    pub fn update(&self, owner_secret: &str, update: SettingsUpdate) -> Result<Settings, SettingsError> {
        let mut settings = self.load()?;
        authorize(&settings, owner_secret)?;
        update.check()?;
        update.apply(&mut settings);
        self.save(&settings)?;
        info!("💾 Settings updated in {}", self.path.display());
        Ok(settings)
    }

    fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(settings)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn authorize(settings: &Settings, presented: &str) -> Result<(), SettingsError> {
    // No secret configured: nobody gets in.
    if settings.owner_secret.is_empty() || presented.is_empty() {
        return Err(SettingsError::Unauthorized);
    }
    if secrets_match(&settings.owner_secret, presented) {
        Ok(())
    } else {
        Err(SettingsError::Unauthorized)
    }
}

/// Compares two secrets without leaking where they differ, or their lengths.
pub fn secrets_match(expected: &str, presented: &str) -> bool {
    let expected = Sha256::digest(expected.as_bytes());
    let presented = Sha256::digest(presented.as_bytes());
    constant_time_eq(&expected, &presented)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
