mod common;

use std::time::Duration;

use mailrelay::config::Config;
use mailrelay::mail_watcher::{MailWatcher, WatcherEvent, WatcherState};
use tokio::sync::mpsc;

use common::owner_settings;

/// A local port with nothing listening on it.
async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn next_state(rx: &mut mpsc::Receiver<WatcherEvent>) -> WatcherState {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher went quiet")
            .expect("watcher channel closed");
        if let WatcherEvent::StateChanged { state, .. } = event {
            return state;
        }
    }
}

#[tokio::test]
async fn test_watcher_keeps_reconnecting_after_connection_errors() {
    let mut imap = Config::default().imap;
    imap.port = closed_port().await;
    imap.reconnect_delay = Duration::from_millis(50);
    imap.connect_timeout = Duration::from_secs(2);

    let mut settings = owner_settings("OTP");
    settings.imap_host = "127.0.0.1".to_string();

    let (tx, mut rx) = mpsc::channel(32);
    let handle = MailWatcher::start(&settings, &imap, 7, tx).unwrap();
    assert_eq!(handle.generation(), 7);

    for _ in 0..2 {
        assert_eq!(next_state(&mut rx).await, WatcherState::Connecting);
        assert!(matches!(next_state(&mut rx).await, WatcherState::Error(_)));
        assert_eq!(next_state(&mut rx).await, WatcherState::Disconnected);
    }

    handle.stop().await;

    let mut last = None;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
        assert_eq!(event.generation(), 7);
        if let WatcherEvent::StateChanged { state, .. } = event {
            last = Some(state);
        }
    }
    assert_eq!(last, Some(WatcherState::Stopped));
}
