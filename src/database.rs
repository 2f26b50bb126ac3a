use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::config::DatabaseConfig;

/// A relayed Telegram message awaiting deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessageRecord {
    pub telegram_message_id: i64,
    pub chat_id: i64,
    pub sent_at: DateTime<Utc>,
}

/// Dedup entry for an email that has been relayed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedEmailRecord {
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub processed_at: DateTime<Utc>,
}

/// Local ledger of processed emails and sent Telegram messages.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to ledger database {}", config.url);

        let options = SqliteConnectOptions::from_str(&config.url)
            .context("Invalid DATABASE_URL")?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("Unable to open the ledger database")?;

        Self::from_pool(pool).await
    }

    /// In-memory ledger, used by dry runs and tests.
    pub async fn in_memory() -> Result<Self> {
        // A single connection, otherwise every connection gets its own empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Unable to open in-memory database")?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let db = Database { pool };
        db.create_tables_if_not_exists().await?;
        Ok(db)
    }

    async fn create_tables_if_not_exists(&self) -> Result<()> {
        debug!("Checking/creating ledger tables");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_emails (
                message_id TEXT PRIMARY KEY NOT NULL,
                subject TEXT NOT NULL,
                sender TEXT NOT NULL,
                processed_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Unable to create processed_emails table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sent_messages (
                telegram_message_id INTEGER NOT NULL,
                chat_id INTEGER NOT NULL,
                sent_at INTEGER NOT NULL,
                PRIMARY KEY (chat_id, telegram_message_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Unable to create sent_messages table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sent_messages_sent_at ON sent_messages (sent_at)")
            .execute(&self.pool)
            .await
            .context("Unable to create index on sent_at")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_processed_emails_processed_at ON processed_emails (processed_at)",
        )
        .execute(&self.pool)
        .await
        .context("Unable to create index on processed_at")?;

        Ok(())
    }

    pub async fn is_processed(&self, message_id: &str) -> Result<bool> {
        let exists = sqlx::query("SELECT 1 FROM processed_emails WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .context("Error checking for duplicates")?;
        Ok(exists.is_some())
    }

    /// Inserts the dedup entry. Returns `false` if it was already there.
    pub async fn record_processed(&self, record: &ProcessedEmailRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO processed_emails (message_id, subject, sender, processed_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&record.message_id)
        .bind(&record.subject)
        .bind(&record.sender)
        .bind(record.processed_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Error inserting processed email")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn record_sent(&self, record: &SentMessageRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO sent_messages (telegram_message_id, chat_id, sent_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(record.telegram_message_id)
        .bind(record.chat_id)
        .bind(record.sent_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Error inserting sent message")?;

        debug!(
            "Sent message {} in chat {} recorded",
            record.telegram_message_id, record.chat_id
        );
        Ok(())
    }

    /// Sent messages whose `sent_at` is strictly before `cutoff`, oldest first.
    pub async fn sent_messages_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<SentMessageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT telegram_message_id, chat_id, sent_at
            FROM sent_messages
            WHERE sent_at < ?
            ORDER BY sent_at ASC
            "#,
        )
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .context("Error retrieving expired sent messages")?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(SentMessageRecord {
                telegram_message_id: row.get("telegram_message_id"),
                chat_id: row.get("chat_id"),
                sent_at: from_millis(row.get("sent_at")),
            });
        }
        Ok(records)
    }

    pub async fn delete_sent(&self, chat_id: i64, telegram_message_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM sent_messages WHERE chat_id = ? AND telegram_message_id = ?")
            .bind(chat_id)
            .bind(telegram_message_id)
            .execute(&self.pool)
            .await
            .context("Error deleting sent message record")?;
        Ok(())
    }

    /// Drops dedup entries older than `cutoff`; returns how many went away.
    pub async fn prune_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM processed_emails WHERE processed_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await
            .context("Error pruning processed emails")?;
        Ok(result.rows_affected())
    }

    pub async fn count_sent(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sent_messages")
            .fetch_one(&self.pool)
            .await
            .context("Error counting sent messages")?;
        Ok(row.get("n"))
    }

    pub async fn count_processed(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM processed_emails")
            .fetch_one(&self.pool)
            .await
            .context("Error counting processed emails")?;
        Ok(row.get("n"))
    }

    pub async fn close(self) -> Result<()> {
        info!("Closing ledger database");
        self.pool.close().await;
        Ok(())
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}
