use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};

use crate::config::RetentionConfig;
use crate::database::Database;
use crate::telegram::ChatApi;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired sent messages looked at.
    pub checked: usize,
    pub deleted: usize,
    /// Left in place for the next run.
    pub failed: usize,
    /// Dedup entries dropped.
    pub pruned: u64,
}

/// Deletes relayed Telegram messages once they age out of the retention window.
pub struct RetentionSweeper {
    chat: Arc<dyn ChatApi>,
    database: Database,
    sent_retention: Duration,
    processed_retention: Duration,
}

impl RetentionSweeper {
    pub fn new(chat: Arc<dyn ChatApi>, database: Database, retention: &RetentionConfig) -> Self {
        RetentionSweeper {
            chat,
            database,
            sent_retention: Duration::days(retention.sent_message_days),
            processed_retention: Duration::days(retention.processed_email_days),
        }
    }

    pub fn set_chat(&mut self, chat: Arc<dyn ChatApi>) {
        self.chat = chat;
    }

    /// One pass. Only records strictly older than `now - retention` are touched.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let cutoff = now - self.sent_retention;
        let expired = self.database.sent_messages_before(cutoff).await?;
        report.checked = expired.len();

        for record in expired {
            let outcome = self
                .chat
                .delete_message(record.chat_id, record.telegram_message_id)
                .await;

            match outcome {
                Ok(()) => {
                    info!("🗑️ Deleted old message: {}", record.telegram_message_id);
                }
                Err(e) if e.is_not_found() => {
                    debug!("Message {} already gone", record.telegram_message_id);
                }
                Err(e) => {
                    warn!(
                        "⚠️ Could not delete message {} (will retry next sweep): {}",
                        record.telegram_message_id, e
                    );
                    report.failed += 1;
                    continue;
                }
            }

            self.database
                .delete_sent(record.chat_id, record.telegram_message_id)
                .await?;
            report.deleted += 1;
        }

        report.pruned = self
            .database
            .prune_processed_before(now - self.processed_retention)
            .await?;

        if report.checked > 0 || report.pruned > 0 {
            info!(
                "🧹 Sweep done: {} deleted, {} failed, {} dedup entries pruned",
                report.deleted, report.failed, report.pruned
            );
        }
        Ok(report)
    }
}
