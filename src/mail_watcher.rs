//! Long-lived IMAP session that pushes new emails to the supervisor.
//!
//! The connection lifecycle is an explicit state machine:
//!
//! ```text
//! Disconnected --Connect--> Connecting --Connected--> Listening
//!      ^                        |  \                      |
//!      |                        |   AuthRejected -> Failed
//!      |                   ConnectionLost            ConnectionLost
//!      |                        v                         |
//!      +----BackoffElapsed---- Error <--------------------+
//! ```
//!
//! Any state moves to `Stopped` on cancellation.

use std::fmt;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ImapConfig;
use crate::email::ParsedEmail;
use crate::imap_client::{FetchedEmail, IdleWake, ImapClient, ImapError, MailboxCredentials};
use crate::settings::{Settings, SettingsError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherState {
    Disconnected,
    Connecting,
    Listening,
    /// Transient failure; a reconnect follows after the back-off delay.
    Error(String),
    /// Authentication was refused. Terminal until settings change.
    Failed(String),
    Stopped,
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherState::Disconnected => write!(f, "disconnected"),
            WatcherState::Connecting => write!(f, "connecting"),
            WatcherState::Listening => write!(f, "listening"),
            WatcherState::Error(e) => write!(f, "reconnecting after error: {}", e),
            WatcherState::Failed(e) => write!(f, "stopped: {}", e),
            WatcherState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Connect,
    Connected,
    ConnectionLost(String),
    AuthRejected(String),
    BackoffElapsed,
    Cancelled,
}

/// The transition table. `None` means the trigger is not valid in `state`.
pub fn transition(state: &WatcherState, trigger: &Trigger) -> Option<WatcherState> {
    use Trigger::*;
    use WatcherState::*;

    match (state, trigger) {
        (Stopped, _) => None,
        (_, Cancelled) => Some(Stopped),
        (Disconnected, Connect) => Some(Connecting),
        (Connecting, Connected) => Some(Listening),
        (Connecting, AuthRejected(e)) => Some(Failed(e.clone())),
        (Connecting, ConnectionLost(e)) | (Listening, ConnectionLost(e)) => Some(Error(e.clone())),
        (Error(_), BackoffElapsed) => Some(Disconnected),
        _ => None,
    }
}

/// How a session ended, as a trigger for the state machine.
///
/// `Ok(())` means the supervisor hung up. Only [`Trigger::AuthRejected`]
/// stops the reconnect loop.
pub fn session_ended(result: &Result<(), ImapError>) -> Trigger {
    match result {
        Err(e) if e.is_fatal() => Trigger::AuthRejected(e.to_string()),
        Err(e) => Trigger::ConnectionLost(e.to_string()),
        Ok(()) => Trigger::ConnectionLost("session ended".to_string()),
    }
}

/// Everything the watcher reports.
///
/// `generation` is taken once per [`MailWatcher::start`], so a watcher
/// replaced by `/reload` can be told apart from its successor. Reconnects
/// inside one watcher keep the generation: its sessions run one after the
/// other in the same task, and a session's pending fetch is dropped with it.
#[derive(Debug, Clone)]
pub enum WatcherEvent {
    Email { generation: u64, email: ParsedEmail },
    StateChanged { generation: u64, state: WatcherState },
}

impl WatcherEvent {
    pub fn generation(&self) -> u64 {
        match self {
            WatcherEvent::Email { generation, .. } | WatcherEvent::StateChanged { generation, .. } => {
                *generation
            }
        }
    }
}

/// How the watcher learns about new mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenMode {
    Idle,
    Poll(Duration),
}

/// Owning handle to a running watcher task.
pub struct WatcherHandle {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// A handle with no session behind it.
    #[cfg(test)]
    pub(crate) fn detached(generation: u64) -> Self {
        WatcherHandle {
            generation,
            cancel: CancellationToken::new(),
            task: tokio::spawn(async {}),
        }
    }

    /// Cancels the session and waits for the task to wind down.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Mail watcher task ended abnormally: {}", e);
        }
    }
}

pub struct MailWatcher {
    creds: MailboxCredentials,
    poll_interval: Duration,
    reconnect_delay: Duration,
    connect_timeout: Duration,
    idle_timeout: Duration,
    generation: u64,
    events: mpsc::Sender<WatcherEvent>,
    cancel: CancellationToken,
    state: WatcherState,
}

impl MailWatcher {
    /// Validates `settings` and spawns the watcher task.
    ///
    /// Refuses to start when a required field is missing instead of
    /// attempting a login that can only fail.
    pub fn start(
        settings: &Settings,
        imap: &ImapConfig,
        generation: u64,
        events: mpsc::Sender<WatcherEvent>,
    ) -> Result<WatcherHandle, SettingsError> {
        settings.validate()?;

        let cancel = CancellationToken::new();
        let watcher = MailWatcher {
            creds: MailboxCredentials {
                host: settings.imap_host.trim().to_string(),
                port: imap.port,
                user: settings.mail_user.clone(),
                password: settings.mail_password.clone(),
                mailbox: imap.mailbox.clone(),
            },
            poll_interval: Duration::from_secs(u64::from(settings.polling_interval_minutes.max(1)) * 60),
            reconnect_delay: imap.reconnect_delay,
            connect_timeout: imap.connect_timeout,
            idle_timeout: imap.idle_timeout,
            generation,
            events,
            cancel: cancel.clone(),
            state: WatcherState::Disconnected,
        };

        info!(
            "👀 Starting mail watcher #{} for {} on {}",
            generation, watcher.creds.user, watcher.creds.host
        );
        let task = tokio::spawn(watcher.run());

        Ok(WatcherHandle {
            generation,
            cancel,
            task,
        })
    }

    async fn run(mut self) {
        loop {
            self.fire(Trigger::Connect).await;

            let cancel = self.cancel.clone();
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.session() => result,
            };

            let trigger = session_ended(&result);
            match &result {
                Err(e) if e.is_fatal() => {
                    error!("❌ {}", e);
                    error!("👉 Check the mailbox address, the app password and that IMAP is enabled");
                }
                Err(e) => warn!("❌ IMAP error: {}", e),
                Ok(()) => warn!("⚠️ IMAP connection ended, reconnecting..."),
            }

            let fatal = matches!(trigger, Trigger::AuthRejected(_));
            self.fire(trigger).await;
            if fatal {
                return;
            }

            if self.events.is_closed() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
            self.fire(Trigger::BackoffElapsed).await;
        }

        self.fire(Trigger::Cancelled).await;
        debug!("Mail watcher #{} stopped", self.generation);
    }

    /// One connection: connect, drain unseen mail, then listen until an error.
    ///
    /// `Ok(())` means the supervisor went away.
    async fn session(&mut self) -> Result<(), ImapError> {
        let mut client = ImapClient::connect(&self.creds, self.connect_timeout).await?;
        self.fire(Trigger::Connected).await;

        let mode = if client.supports_idle().await? {
            info!("👀 Listening for new emails (IDLE mode)...");
            ListenMode::Idle
        } else {
            info!("👀 Server has no IDLE, polling every {:?}", self.poll_interval);
            ListenMode::Poll(self.poll_interval)
        };

        if !self.forward(client.fetch_unseen().await?).await {
            return Ok(());
        }

        loop {
            match mode {
                ListenMode::Idle => {
                    let (next, wake) = client.idle(self.idle_timeout).await?;
                    client = next;
                    if wake == IdleWake::Timeout {
                        debug!("IDLE re-issued after {:?}", self.idle_timeout);
                    }
                }
                ListenMode::Poll(every) => tokio::time::sleep(every).await,
            }

            if !self.forward(client.fetch_unseen().await?).await {
                let _ = client.logout().await;
                return Ok(());
            }
        }
    }

    /// Sends emails upstream; `false` once the receiver is gone.
    async fn forward(&self, fetched: Vec<FetchedEmail>) -> bool {
        for FetchedEmail { email, .. } in fetched {
            let event = WatcherEvent::Email {
                generation: self.generation,
                email,
            };
            if self.events.send(event).await.is_err() {
                return false;
            }
        }
        true
    }

    async fn fire(&mut self, trigger: Trigger) {
        let Some(next) = transition(&self.state, &trigger) else {
            debug!("Ignoring {:?} in state {:?}", trigger, self.state);
            return;
        };
        debug!("Watcher #{}: {:?} -> {:?}", self.generation, self.state, next);
        self.state = next.clone();

        let _ = self
            .events
            .send(WatcherEvent::StateChanged {
                generation: self.generation,
                state: next,
            })
            .await;
    }
}
