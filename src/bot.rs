//! The supervisor: one task that owns settings, ledger, Telegram client and
//! the mail watcher, and serializes everything that mutates them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

use crate::commands::{self, CommandContext, ReloadOutcome, StatusSnapshot};
use crate::config::Config;
use crate::database::Database;
use crate::email::{ParsedEmail, Relay, RelayOutcome, RelayStats};
use crate::imap_client::{FetchedEmail, ImapClient, MailboxCredentials};
use crate::mail_watcher::{MailWatcher, WatcherEvent, WatcherHandle, WatcherState};
use crate::settings::{Settings, SettingsStore};
use crate::sweeper::RetentionSweeper;
use crate::telegram::{ChatApi, TelegramClient};

const SWEEP_EVERY: Duration = Duration::from_secs(60 * 60);
const UPDATE_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Undelivered emails kept for another attempt; the oldest are dropped first.
const MAX_PENDING_RETRIES: usize = 50;

/// Why [`Bot::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Ctrl+C, or SIGTERM from the process manager.
    Stopped,
    /// `/update` pulled new sources; the process manager should restart us.
    Restart,
}

/// A text message addressed to the bot.
#[derive(Debug, Clone)]
struct Incoming {
    chat_id: i64,
    text: String,
}

struct UpdatePoller {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl UpdatePoller {
    fn spawn(client: Arc<TelegramClient>, tx: mpsc::Sender<Incoming>) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut offset: Option<i64> = None;
            loop {
                let result = tokio::select! {
                    _ = token.cancelled() => break,
                    result = client.get_updates(offset) => result,
                };

                match result {
                    Ok(updates) => {
                        for update in updates {
                            offset = Some(update.update_id + 1);
                            let Some(message) = update.message else { continue };
                            let Some(text) = message.text else { continue };
                            let incoming = Incoming {
                                chat_id: message.chat.id,
                                text,
                            };
                            if tx.send(incoming).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("⚠️ Telegram polling error: {}", e);
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(UPDATE_RETRY_DELAY) => {}
                        }
                    }
                }
            }
            debug!("Telegram update poller stopped");
        });
        UpdatePoller { cancel, task }
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

pub struct Bot {
    config: Config,
    store: SettingsStore,
    settings: Settings,
    database: Database,
    telegram: Arc<TelegramClient>,
    relay: Relay,
    sweeper: RetentionSweeper,
    dry_run: bool,

    watcher: Option<WatcherHandle>,
    watcher_state: Option<WatcherState>,
    next_generation: u64,
    events_tx: mpsc::Sender<WatcherEvent>,
    events_rx: mpsc::Receiver<WatcherEvent>,

    poller: Option<UpdatePoller>,
    incoming_tx: mpsc::Sender<Incoming>,
    incoming_rx: mpsc::Receiver<Incoming>,

    stats: RelayStats,
    retries: VecDeque<ParsedEmail>,
    restart_requested: bool,
}

impl Bot {
    /// Builds the supervisor from already-validated settings.
    pub async fn new(config: Config, settings: Settings, dry_run: bool) -> Result<Self> {
        let database = if dry_run {
            Database::in_memory().await?
        } else {
            Database::new(&config.database).await?
        };

        let telegram = Arc::new(
            TelegramClient::new(&config.telegram.api_url, &settings.telegram_bot_token)
                .context("Unable to build the Telegram client")?,
        );
        telegram
            .get_me()
            .await
            .context("Telegram rejected the bot token")?;

        let chat: Arc<dyn ChatApi> = telegram.clone();
        Ok(Self::assemble(config, settings, database, telegram, chat, dry_run))
    }

    /// Wires the parts together. `chat` carries relays and deletions,
    /// `telegram` command replies and update polling.
    fn assemble(
        config: Config,
        settings: Settings,
        database: Database,
        telegram: Arc<TelegramClient>,
        chat: Arc<dyn ChatApi>,
        dry_run: bool,
    ) -> Self {
        let store = SettingsStore::new(config.settings_path.clone());
        let relay = if dry_run {
            Relay::new_dry_run(chat.clone(), database.clone())
        } else {
            Relay::new(chat.clone(), database.clone())
        };
        let sweeper = RetentionSweeper::new(chat, database.clone(), &config.retention);

        let (events_tx, events_rx) = mpsc::channel(64);
        let (incoming_tx, incoming_rx) = mpsc::channel(16);

        Bot {
            config,
            store,
            settings,
            database,
            telegram,
            relay,
            sweeper,
            dry_run,
            watcher: None,
            watcher_state: None,
            next_generation: 1,
            events_tx,
            events_rx,
            poller: None,
            incoming_tx,
            incoming_rx,
            stats: RelayStats::new(),
            retries: VecDeque::new(),
            restart_requested: false,
        }
    }

    pub async fn run(mut self) -> Result<Shutdown> {
        let (sweep_tx, mut sweep_rx) = mpsc::channel::<()>(1);
        let scheduler = JobScheduler::new().await?;
        let job = Job::new_repeated_async(SWEEP_EVERY, move |_uuid, _l| {
            let tx = sweep_tx.clone();
            Box::pin(async move {
                // A sweep already queued covers this tick too.
                let _ = tx.try_send(());
            })
        })?;
        scheduler.add(job).await?;
        scheduler.start().await?;
        info!("🧹 Retention sweep scheduled every {:?}", SWEEP_EVERY);

        self.poller = Some(UpdatePoller::spawn(self.telegram.clone(), self.incoming_tx.clone()));

        if self.settings.is_active {
            self.start_watcher();
        } else {
            info!("⏸️ Bot is disabled in settings. Enable it and send /reload.");
        }

        info!("✅ Bot is running! Press Ctrl+C to stop.");
        info!("💡 Use /reload in Telegram to reload settings.");

        let signal = shutdown_signal();
        tokio::pin!(signal);

        let shutdown = loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.handle_watcher_event(event).await,
                Some(incoming) = self.incoming_rx.recv() => {
                    self.handle_incoming(incoming).await;
                    if self.restart_requested {
                        break Shutdown::Restart;
                    }
                }
                Some(()) = sweep_rx.recv() => self.run_sweep().await,
                _ = &mut signal => break Shutdown::Stopped,
            }
        };

        self.stop_watcher().await;
        if let Some(poller) = self.poller.take() {
            poller.stop().await;
        }
        let mut scheduler = scheduler;
        if let Err(e) = scheduler.shutdown().await {
            warn!("Scheduler shutdown failed: {}", e);
        }

        info!(
            "📊 Session totals: {} sent, {} skipped, {} duplicates, {} failed",
            self.stats.sent, self.stats.skipped, self.stats.duplicates, self.stats.failed
        );
        self.database.close().await?;
        Ok(shutdown)
    }

    fn start_watcher(&mut self) {
        let generation = self.next_generation;
        self.next_generation += 1;

        match MailWatcher::start(&self.settings, &self.config.imap, generation, self.events_tx.clone()) {
            Ok(handle) => {
                self.watcher = Some(handle);
                self.watcher_state = Some(WatcherState::Disconnected);
            }
            Err(e) => {
                error!("❌ Mail watcher not started: {}", e);
                self.watcher_state = None;
            }
        }
    }

    async fn stop_watcher(&mut self) {
        if let Some(handle) = self.watcher.take() {
            info!("Stopping mail watcher #{}", handle.generation());
            handle.stop().await;
        }
        self.watcher_state = None;
    }

    async fn handle_watcher_event(&mut self, event: WatcherEvent) {
        let current = self.watcher.as_ref().map(WatcherHandle::generation);
        if current != Some(event.generation()) {
            debug!("Dropping event from stale watcher #{}", event.generation());
            return;
        }

        match event {
            WatcherEvent::StateChanged { state, .. } => {
                if let WatcherState::Failed(reason) = &state {
                    self.notify_owner(&format!(
                        "❌ Mail login failed: {}\nFix the settings, then send /reload.",
                        reason
                    ))
                    .await;
                }
                self.watcher_state = Some(state);
            }
            WatcherEvent::Email { email, .. } => {
                self.retry_failed().await;
                self.relay_one(email).await;
            }
        }
    }

    /// Relays one email; an undelivered one is queued for the next cycle.
    async fn relay_one(&mut self, email: ParsedEmail) {
        let outcome = relay_or_fail(&self.relay, &email, &self.settings).await;
        self.stats.record(&outcome);

        if outcome.needs_retry() {
            if let Some(dropped) = queue_retry(&mut self.retries, email, MAX_PENDING_RETRIES) {
                warn!("⚠️ Retry queue full, giving up on {}", dropped.message_id);
            }
        }
    }

    async fn retry_failed(&mut self) {
        if self.retries.is_empty() || !self.settings.is_active {
            return;
        }
        info!("🔁 Retrying {} undelivered email(s)", self.retries.len());
        let pending: Vec<ParsedEmail> = self.retries.drain(..).collect();
        for email in pending {
            self.relay_one(email).await;
        }
    }

    async fn handle_incoming(&mut self, incoming: Incoming) {
        let Some(reply) = commands::dispatch(self, incoming.chat_id, &incoming.text).await else {
            return;
        };
        if let Err(e) = self
            .telegram
            .send_message(incoming.chat_id, &reply.text, reply.parse_mode)
            .await
        {
            warn!("⚠️ Could not answer chat {}: {}", incoming.chat_id, e);
        }
    }

    async fn run_sweep(&mut self) {
        self.retry_failed().await;
        if self.dry_run {
            debug!("Dry run: retention sweep skipped");
            return;
        }
        if let Err(e) = self.sweeper.sweep(Utc::now()).await {
            error!("❌ Retention sweep failed: {:#}", e);
        }
    }

    async fn notify_owner(&self, text: &str) {
        let Ok(chat_id) = self.settings.owner_chat_id() else {
            return;
        };
        if let Err(e) = self.telegram.send_message(chat_id, text, None).await {
            warn!("⚠️ Could not notify owner: {}", e);
        }
    }

    fn replace_telegram(&mut self, token: &str) -> Result<()> {
        let telegram = Arc::new(TelegramClient::new(&self.config.telegram.api_url, token)?);
        let chat: Arc<dyn ChatApi> = telegram.clone();
        self.relay.set_chat(chat.clone());
        self.sweeper.set_chat(chat);
        self.telegram = telegram;
        Ok(())
    }
}

#[async_trait]
impl CommandContext for Bot {
    fn owner_id(&self) -> String {
        self.settings.telegram_owner_id.clone()
    }

    async fn status(&self) -> Result<StatusSnapshot> {
        Ok(StatusSnapshot {
            watcher: self.watcher_state.clone(),
            mail_user: self.settings.mail_user.clone(),
            email_filter: self.settings.email_filter.clone(),
            retention_days: self.config.retention.sent_message_days,
            sent_messages: self.database.count_sent().await?,
            processed_emails: self.database.count_processed().await?,
        })
    }

    async fn reload(&mut self) -> Result<ReloadOutcome> {
        info!("🔄 Reloading settings from {}", self.store.path().display());
        let next = self.store.load()?;
        next.validate()?;

        if next.telegram_bot_token != self.settings.telegram_bot_token {
            info!("🤖 Bot token changed, restarting Telegram polling");
            self.replace_telegram(&next.telegram_bot_token)?;
            if let Some(poller) = self.poller.take() {
                poller.stop().await;
            }
            self.poller = Some(UpdatePoller::spawn(self.telegram.clone(), self.incoming_tx.clone()));
        }

        let healthy = watcher_healthy(self.watcher.is_some(), self.watcher_state.as_ref());
        let plan = reload_plan(&self.settings, &next, healthy);
        match plan {
            ReloadOutcome::Deactivated => {
                self.stop_watcher().await;
                self.settings = next;
            }
            ReloadOutcome::Restarted => {
                self.stop_watcher().await;
                self.settings = next;
                self.start_watcher();
            }
            ReloadOutcome::Swapped => self.settings = next,
        }
        Ok(plan)
    }

    async fn update(&mut self) -> Result<String> {
        let Some(repo) = self.config.update_repo_dir.clone() else {
            anyhow::bail!("UPDATE_REPO_DIR is not configured");
        };

        info!("🔄 Pulling updates in {}", repo.display());
        let output = tokio::process::Command::new("git")
            .arg("pull")
            .current_dir(&repo)
            .output()
            .await
            .context("Unable to run git")?;

        if !output.status.success() {
            anyhow::bail!("git pull failed: {}", String::from_utf8_lossy(&output.stderr).trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        self.restart_requested = true;
        Ok(if stdout.is_empty() {
            "No changes".to_string()
        } else {
            stdout
        })
    }
}

/// One polling pass without IDLE: connect, relay unseen mail, log out.
pub async fn check_once(config: &Config, settings: &Settings, relay: &Relay) -> Result<RelayStats> {
    settings.validate()?;

    let creds = MailboxCredentials {
        host: settings.imap_host.trim().to_string(),
        port: config.imap.port,
        user: settings.mail_user.clone(),
        password: settings.mail_password.clone(),
        mailbox: config.imap.mailbox.clone(),
    };

    let mut client = ImapClient::connect(&creds, config.imap.connect_timeout).await?;
    let fetched = client.fetch_unseen().await?;

    let (stats, undelivered) = relay_fetched(relay, settings, &fetched).await;
    if let Err(e) = client.mark_unseen(&undelivered).await {
        warn!("⚠️ Could not mark {} undelivered email(s) unread: {}", undelivered.len(), e);
    }

    if let Err(e) = client.logout().await {
        warn!("IMAP logout failed: {}", e);
    }
    Ok(stats)
}

/// Relays a fetched batch; returns the stats and the sequence numbers that
/// still need delivery.
async fn relay_fetched(
    relay: &Relay,
    settings: &Settings,
    fetched: &[FetchedEmail],
) -> (RelayStats, Vec<u32>) {
    let mut stats = RelayStats::new();
    let mut undelivered = Vec::new();
    for FetchedEmail { seq, email } in fetched {
        let outcome = relay_or_fail(relay, email, settings).await;
        stats.record(&outcome);
        if outcome.needs_retry() {
            undelivered.push(*seq);
        }
    }
    (stats, undelivered)
}

async fn relay_or_fail(relay: &Relay, email: &ParsedEmail, settings: &Settings) -> RelayOutcome {
    match relay.relay(email, settings).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("❌ Error processing email {}: {:#}", email.message_id, e);
            RelayOutcome::Failed {
                reason: e.to_string(),
            }
        }
    }
}

/// Appends `email`; when the queue is at `cap`, the oldest entry is evicted
/// and returned.
fn queue_retry(
    queue: &mut VecDeque<ParsedEmail>,
    email: ParsedEmail,
    cap: usize,
) -> Option<ParsedEmail> {
    let dropped = if queue.len() >= cap {
        queue.pop_front()
    } else {
        None
    };
    queue.push_back(email);
    dropped
}

fn watcher_healthy(running: bool, state: Option<&WatcherState>) -> bool {
    running && !matches!(state, None | Some(WatcherState::Failed(_)))
}

/// What `/reload` does with the watcher when moving from `current` to `next`.
fn reload_plan(current: &Settings, next: &Settings, watcher_healthy: bool) -> ReloadOutcome {
    if !next.is_active {
        ReloadOutcome::Deactivated
    } else if current.mail_credentials_differ(next) || !watcher_healthy {
        ReloadOutcome::Restarted
    } else {
        ReloadOutcome::Swapped
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Unable to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Unable to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("🛑 Ctrl+C received, shutting down"),
        _ = terminate => info!("🛑 SIGTERM received, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::telegram::{ParseMode, TelegramError};

    #[derive(Default)]
    struct RecordingChat {
        offline: bool,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatApi for RecordingChat {
        async fn send_message(
            &self,
            _chat_id: i64,
            text: &str,
            _parse_mode: Option<ParseMode>,
        ) -> Result<i64, TelegramError> {
            if self.offline {
                return Err(TelegramError::Api {
                    code: Some(502),
                    description: "Bad Gateway".to_string(),
                });
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push(text.to_string());
            Ok(sent.len() as i64)
        }

        async fn delete_message(&self, _chat_id: i64, _message_id: i64) -> Result<(), TelegramError> {
            Ok(())
        }
    }

    fn settings() -> Settings {
        Settings {
            telegram_bot_token: "0:test".to_string(),
            telegram_owner_id: "111".to_string(),
            mail_user: "me@example.com".to_string(),
            mail_password: "secret".to_string(),
            imap_host: "imap.example.com".to_string(),
            email_filter: "OTP".to_string(),
            is_active: true,
            owner_secret: "letmein".to_string(),
            ..Settings::default()
        }
    }

    fn email(message_id: &str, subject: &str) -> ParsedEmail {
        ParsedEmail {
            from: "bank@example.com".to_string(),
            subject: subject.to_string(),
            body_text: "1234".to_string(),
            message_id: message_id.to_string(),
        }
    }

    async fn bot_with(chat: Arc<RecordingChat>, watcher_generation: u64) -> Bot {
        let telegram = Arc::new(TelegramClient::new("http://127.0.0.1:9", "0:test").unwrap());
        let database = Database::in_memory().await.unwrap();
        let mut bot = Bot::assemble(Config::default(), settings(), database, telegram, chat, false);
        bot.watcher = Some(WatcherHandle::detached(watcher_generation));
        bot.watcher_state = Some(WatcherState::Listening);
        bot
    }

    #[tokio::test]
    async fn test_events_from_a_replaced_watcher_are_ignored() {
        let chat = Arc::new(RecordingChat::default());
        let mut bot = bot_with(chat.clone(), 2).await;

        bot.handle_watcher_event(WatcherEvent::Email {
            generation: 1,
            email: email("<old@example.com>", "OTP 1111"),
        })
        .await;
        bot.handle_watcher_event(WatcherEvent::StateChanged {
            generation: 1,
            state: WatcherState::Failed("LOGIN failed".to_string()),
        })
        .await;

        assert!(chat.sent.lock().unwrap().is_empty());
        assert_eq!(bot.stats.sent, 0);
        assert_eq!(bot.watcher_state, Some(WatcherState::Listening));

        bot.handle_watcher_event(WatcherEvent::Email {
            generation: 2,
            email: email("<new@example.com>", "OTP 2222"),
        })
        .await;
        assert_eq!(chat.sent.lock().unwrap().len(), 1);
        assert_eq!(bot.stats.sent, 1);
    }

    #[tokio::test]
    async fn test_undelivered_email_waits_in_the_retry_queue() {
        let chat = Arc::new(RecordingChat {
            offline: true,
            ..RecordingChat::default()
        });
        let mut bot = bot_with(chat, 3).await;

        bot.handle_watcher_event(WatcherEvent::Email {
            generation: 3,
            email: email("<a@example.com>", "OTP 1111"),
        })
        .await;
        bot.handle_watcher_event(WatcherEvent::Email {
            generation: 3,
            email: email("<b@example.com>", "Newsletter"),
        })
        .await;

        assert_eq!(bot.stats.failed, 2);
        assert_eq!(bot.stats.skipped, 1);
        let queued: Vec<_> = bot.retries.iter().map(|e| e.message_id.as_str()).collect();
        assert_eq!(queued, vec!["<a@example.com>"]);
    }

    #[test]
    fn test_full_retry_queue_drops_the_oldest() {
        let mut queue = VecDeque::new();
        for i in 0..MAX_PENDING_RETRIES {
            let queued = email(&format!("<{}@x>", i), "OTP");
            let dropped = queue_retry(&mut queue, queued, MAX_PENDING_RETRIES);
            assert!(dropped.is_none());
        }

        let dropped = queue_retry(&mut queue, email("<late@x>", "OTP"), MAX_PENDING_RETRIES);
        assert_eq!(dropped.map(|e| e.message_id), Some("<0@x>".to_string()));
        assert_eq!(queue.len(), MAX_PENDING_RETRIES);
        assert_eq!(queue.front().map(|e| e.message_id.as_str()), Some("<1@x>"));
        assert_eq!(queue.back().map(|e| e.message_id.as_str()), Some("<late@x>"));
    }

    #[test]
    fn test_reload_plan() {
        let current = settings();

        let mut filter_only = settings();
        filter_only.email_filter = "code".to_string();
        assert_eq!(reload_plan(&current, &filter_only, true), ReloadOutcome::Swapped);
        assert_eq!(reload_plan(&current, &filter_only, false), ReloadOutcome::Restarted);

        let mut new_password = settings();
        new_password.mail_password = "rotated".to_string();
        assert_eq!(reload_plan(&current, &new_password, true), ReloadOutcome::Restarted);

        let mut disabled = new_password.clone();
        disabled.is_active = false;
        assert_eq!(reload_plan(&current, &disabled, true), ReloadOutcome::Deactivated);
    }

    #[test]
    fn test_watcher_health() {
        assert!(watcher_healthy(true, Some(&WatcherState::Listening)));
        assert!(watcher_healthy(true, Some(&WatcherState::Disconnected)));
        assert!(!watcher_healthy(true, Some(&WatcherState::Failed("LOGIN failed".into()))));
        assert!(!watcher_healthy(true, None));
        assert!(!watcher_healthy(false, Some(&WatcherState::Listening)));
    }

    #[tokio::test]
    async fn test_only_undelivered_messages_stay_unread() {
        let database = Database::in_memory().await.unwrap();
        let fetched = vec![
            FetchedEmail {
                seq: 4,
                email: email("<otp@example.com>", "OTP 1111"),
            },
            FetchedEmail {
                seq: 7,
                email: email("<news@example.com>", "Newsletter"),
            },
        ];

        let offline = Arc::new(RecordingChat {
            offline: true,
            ..RecordingChat::default()
        });
        let relay = Relay::new(offline, database.clone());
        let (stats, undelivered) = relay_fetched(&relay, &settings(), &fetched).await;
        assert_eq!(undelivered, vec![4]);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.skipped, 1);

        let relay = Relay::new(Arc::new(RecordingChat::default()), database);
        let (stats, undelivered) = relay_fetched(&relay, &settings(), &fetched).await;
        assert!(undelivered.is_empty());
        assert_eq!(stats.sent, 1);
    }
}
