mod common;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use mailrelay::config::RetentionConfig;
use mailrelay::database::{Database, ProcessedEmailRecord, SentMessageRecord};
use mailrelay::sweeper::RetentionSweeper;

use common::{DeleteFailure, FakeChat, OWNER_CHAT_ID};

fn retention() -> RetentionConfig {
    RetentionConfig {
        sent_message_days: 7,
        processed_email_days: 30,
    }
}

async fn sent_at(db: &Database, telegram_message_id: i64, sent_at: DateTime<Utc>) {
    db.record_sent(&SentMessageRecord {
        telegram_message_id,
        chat_id: OWNER_CHAT_ID,
        sent_at,
    })
    .await
    .unwrap();
}

async fn processed_at(db: &Database, message_id: &str, processed_at: DateTime<Utc>) {
    db.record_processed(&ProcessedEmailRecord {
        message_id: message_id.to_string(),
        subject: "Your OTP".to_string(),
        sender: "alerts@bank.example".to_string(),
        processed_at,
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_only_expired_messages_are_deleted() {
    let db = Database::in_memory().await.unwrap();
    let chat = Arc::new(FakeChat::new());
    let sweeper = RetentionSweeper::new(chat.clone(), db.clone(), &retention());
    let now = Utc::now();

    sent_at(&db, 1, now - Duration::days(8)).await;
    sent_at(&db, 2, now - Duration::days(6)).await;

    let report = sweeper.sweep(now).await.unwrap();

    assert_eq!(report.checked, 1);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(chat.deleted(), vec![(OWNER_CHAT_ID, 1)]);
    assert_eq!(db.count_sent().await.unwrap(), 1);
}

#[tokio::test]
async fn test_message_exactly_at_cutoff_is_kept() {
    let db = Database::in_memory().await.unwrap();
    let chat = Arc::new(FakeChat::new());
    let sweeper = RetentionSweeper::new(chat.clone(), db.clone(), &retention());
    let now = Utc::now();

    sent_at(&db, 1, now - Duration::days(7)).await;

    let report = sweeper.sweep(now).await.unwrap();

    assert_eq!(report.checked, 0);
    assert!(chat.deleted().is_empty());
    assert_eq!(db.count_sent().await.unwrap(), 1);
}

#[tokio::test]
async fn test_already_deleted_message_counts_as_success() {
    let db = Database::in_memory().await.unwrap();
    let chat = Arc::new(FakeChat::new().failing_delete(1, DeleteFailure::NotFound));
    let sweeper = RetentionSweeper::new(chat.clone(), db.clone(), &retention());
    let now = Utc::now();

    sent_at(&db, 1, now - Duration::days(10)).await;

    let report = sweeper.sweep(now).await.unwrap();

    assert_eq!(report.deleted, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(db.count_sent().await.unwrap(), 0);
}

#[tokio::test]
async fn test_failed_delete_is_retried_next_sweep() {
    let db = Database::in_memory().await.unwrap();
    let chat = Arc::new(FakeChat::new().failing_delete(1, DeleteFailure::Forbidden));
    let sweeper = RetentionSweeper::new(chat.clone(), db.clone(), &retention());
    let now = Utc::now();

    sent_at(&db, 1, now - Duration::days(9)).await;
    sent_at(&db, 2, now - Duration::days(9)).await;

    let report = sweeper.sweep(now).await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.failed, 1);

    // The failed record is still there and gets picked up again.
    let remaining = db.sent_messages_before(now - Duration::days(7)).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].telegram_message_id, 1);

    let again = sweeper.sweep(now + Duration::hours(1)).await.unwrap();
    assert_eq!(again.checked, 1);
    assert_eq!(again.failed, 1);
}

#[tokio::test]
async fn test_old_dedup_entries_are_pruned() {
    let db = Database::in_memory().await.unwrap();
    let chat = Arc::new(FakeChat::new());
    let sweeper = RetentionSweeper::new(chat, db.clone(), &retention());
    let now = Utc::now();

    processed_at(&db, "old@bank.example", now - Duration::days(31)).await;
    processed_at(&db, "recent@bank.example", now - Duration::days(2)).await;

    let report = sweeper.sweep(now).await.unwrap();

    assert_eq!(report.pruned, 1);
    assert!(!db.is_processed("old@bank.example").await.unwrap());
    assert!(db.is_processed("recent@bank.example").await.unwrap());
}
