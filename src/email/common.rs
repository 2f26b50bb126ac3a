/// Common structures and utilities for relayed emails
use log::warn;
use mail_parser::MessageParser;
use sha2::{Digest, Sha256};

/// Body characters kept in the Telegram message.
pub const BODY_PREVIEW_CHARS: usize = 500;

/// Email as the relay sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEmail {
    pub from: String,
    pub subject: String,
    pub body_text: String,
    pub message_id: String,
}

impl ParsedEmail {
    /// Parses a raw RFC 822 message.
    ///
    /// Missing headers fall back to placeholders. A message without a
    /// `Message-ID` gets one derived from its content, so a redelivery of the
    /// same bytes still deduplicates.
    pub fn parse(raw: &[u8]) -> ParsedEmail {
        let parsed = MessageParser::default().parse(raw);

        let Some(message) = parsed else {
            warn!("Unable to parse email with mail-parser, using fallback");
            return ParsedEmail {
                from: "Unknown".to_string(),
                subject: "No Subject".to_string(),
                body_text: String::new(),
                message_id: synthetic_message_id(raw),
            };
        };

        let from = message
            .from()
            .and_then(|addrs| addrs.first())
            .map(|addr| match (&addr.name, &addr.address) {
                (Some(name), Some(email)) => format!("{} <{}>", name, email),
                (None, Some(email)) => email.to_string(),
                (Some(name), None) => name.to_string(),
                (None, None) => "Unknown".to_string(),
            })
            .unwrap_or_else(|| "Unknown".to_string());

        let subject = message
            .subject()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("No Subject")
            .to_string();

        let body_text = message
            .body_text(0)
            .map(|body| normalize_body(&body))
            .unwrap_or_default();

        let message_id = message
            .message_id()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| synthetic_message_id(raw));

        ParsedEmail {
            from,
            subject,
            body_text,
            message_id,
        }
    }

    /// First [`BODY_PREVIEW_CHARS`] characters of the body.
    pub fn body_preview(&self) -> &str {
        match self.body_text.char_indices().nth(BODY_PREVIEW_CHARS) {
            Some((end, _)) => &self.body_text[..end],
            None => &self.body_text,
        }
    }
}

fn normalize_body(body: &str) -> String {
    body.replace("\r\n", "\n").trim().to_string()
}

fn synthetic_message_id(raw: &[u8]) -> String {
    let digest = Sha256::digest(raw);
    let hex: String = digest.iter().take(12).map(|b| format!("{:02x}", b)).collect();
    format!("msg-{}", hex)
}

/// Counters for one batch of relayed emails.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub sent: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> usize {
        self.sent + self.skipped + self.duplicates + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"From: \"Bank Alerts\" <alerts@bank.example>\r\n\
To: me@outlook.com\r\n\
Subject: Your OTP is 1234\r\n\
Message-ID: <abc123@bank.example>\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Use 1234 to sign in.\r\nIt expires in 5 minutes.\r\n";

    #[test]
    fn test_parse_headers_and_body() {
        let email = ParsedEmail::parse(SAMPLE);
        assert_eq!(email.from, "Bank Alerts <alerts@bank.example>");
        assert_eq!(email.subject, "Your OTP is 1234");
        assert_eq!(email.message_id, "abc123@bank.example");
        assert_eq!(email.body_text, "Use 1234 to sign in.\nIt expires in 5 minutes.");
    }

    #[test]
    fn test_missing_headers_use_placeholders() {
        let raw = b"Content-Type: text/plain\r\n\r\nhello\r\n";
        let email = ParsedEmail::parse(raw);
        assert_eq!(email.from, "Unknown");
        assert_eq!(email.subject, "No Subject");
        assert!(email.message_id.starts_with("msg-"));
        assert_eq!(email.message_id, ParsedEmail::parse(raw).message_id);
    }

    #[test]
    fn test_body_preview_truncates_on_char_boundary() {
        let email = ParsedEmail {
            from: "a".into(),
            subject: "b".into(),
            body_text: "é".repeat(BODY_PREVIEW_CHARS + 20),
            message_id: "c".into(),
        };
        assert_eq!(email.body_preview().chars().count(), BODY_PREVIEW_CHARS);

        let short = ParsedEmail { body_text: "short".into(), ..email };
        assert_eq!(short.body_preview(), "short");
    }
}
