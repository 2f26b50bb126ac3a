use std::future::Future;
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::Session;
use async_native_tls::{TlsConnector, TlsStream};
use futures::stream::StreamExt;
use log::{debug, info};
use tokio::net::TcpStream;

use crate::email::ParsedEmail;

pub type ImapSession = Session<TlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ImapError {
    /// The server refused the credentials. Retrying will not help.
    #[error("IMAP authentication failed: {0}")]
    Authentication(String),

    #[error("IMAP connection error: {0}")]
    Connection(String),

    #[error("IMAP {stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },
}

impl ImapError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ImapError::Authentication(_))
    }
}

impl From<async_imap::error::Error> for ImapError {
    fn from(err: async_imap::error::Error) -> Self {
        ImapError::Connection(err.to_string())
    }
}

/// Where and as whom to log in.
#[derive(Debug, Clone, PartialEq)]
pub struct MailboxCredentials {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub mailbox: String,
}

/// A fetched message and its sequence number in the selected mailbox.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedEmail {
    pub seq: u32,
    pub email: ParsedEmail,
}

/// What ended an IDLE wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleWake {
    /// The server pushed something (usually `EXISTS`).
    NewData,
    /// Our own re-issue timer fired.
    Timeout,
}

pub struct ImapClient {
    session: ImapSession,
}

impl ImapClient {
    /// Opens TLS, logs in and selects the mailbox.
    ///
    /// Each network stage is bounded by `timeout` so a hung socket becomes
    /// a retryable error.
    pub async fn connect(creds: &MailboxCredentials, timeout: Duration) -> Result<Self, ImapError> {
        info!("📡 Connecting IMAP: {}:{} ...", creds.host, creds.port);

        let tls_stream = with_timeout("connect", timeout, async {
            let tcp_stream = TcpStream::connect((creds.host.as_str(), creds.port))
                .await
                .map_err(|e| ImapError::Connection(format!("TCP connection failed: {}", e)))?;

            TlsConnector::new()
                .connect(&creds.host, tcp_stream)
                .await
                .map_err(|e| ImapError::Connection(format!("TLS handshake failed: {}", e)))
        })
        .await?;

        let client = async_imap::Client::new(tls_stream);

        let session = with_timeout("authentication", timeout, async {
            client
                .login(&creds.user, &creds.password)
                .await
                .map_err(|(e, _client)| match e {
                    async_imap::error::Error::No(msg) | async_imap::error::Error::Bad(msg) => {
                        ImapError::Authentication(msg)
                    }
                    other => ImapError::Connection(other.to_string()),
                })
        })
        .await?;

        let mut imap = ImapClient { session };
        let exists = imap.select(&creds.mailbox, timeout).await?;
        info!("📬 IMAP connected, {} opened: {} messages", creds.mailbox, exists);
        Ok(imap)
    }

    async fn select(&mut self, mailbox: &str, timeout: Duration) -> Result<u32, ImapError> {
        let selected = with_timeout("SELECT", timeout, async {
            self.session.select(mailbox).await.map_err(ImapError::from)
        })
        .await?;
        Ok(selected.exists)
    }

    pub async fn supports_idle(&mut self) -> Result<bool, ImapError> {
        let capabilities = self.session.capabilities().await?;
        Ok(capabilities.has_str("IDLE"))
    }

    /// Fetches every unseen message, marks them seen, and parses them.
    ///
    /// The `\Seen` flag is what keeps a reconnect from redelivering these;
    /// a crash before the relay finishes can still redeliver, which the
    /// dedup ledger absorbs. Use [`ImapClient::mark_unseen`] to hand back
    /// messages that could not be relayed.
    pub async fn fetch_unseen(&mut self) -> Result<Vec<FetchedEmail>, ImapError> {
        let mut seqs: Vec<u32> = self.session.search("UNSEEN").await?.into_iter().collect();
        if seqs.is_empty() {
            debug!("No unseen messages");
            return Ok(Vec::new());
        }
        seqs.sort_unstable();
        let seq_set = sequence_set(&seqs);
        info!("📨 {} new email(s)!", seqs.len());

        let fetched: Vec<_> = self
            .session
            .fetch(&seq_set, "RFC822")
            .await?
            .collect::<Vec<_>>()
            .await;

        let mut raw_messages: Vec<(u32, Vec<u8>)> = Vec::with_capacity(fetched.len());
        for fetch in fetched {
            let fetch = fetch?;
            if let Some(body) = fetch.body() {
                raw_messages.push((fetch.message, body.to_vec()));
            }
        }
        raw_messages.sort_by_key(|(seq, _)| *seq);

        {
            let store_stream = self.session.store(&seq_set, "+FLAGS (\\Seen)").await?;
            // The STORE only completes once its responses are drained.
            let _store_results: Vec<_> = store_stream.collect::<Vec<_>>().await;
        }

        Ok(raw_messages
            .into_iter()
            .map(|(seq, raw)| {
                debug!("Fetched message {}, {} bytes", seq, raw.len());
                FetchedEmail {
                    seq,
                    email: ParsedEmail::parse(&raw),
                }
            })
            .collect())
    }

    /// Clears `\Seen` so the next SEARCH UNSEEN returns these messages again.
    pub async fn mark_unseen(&mut self, seqs: &[u32]) -> Result<(), ImapError> {
        if seqs.is_empty() {
            return Ok(());
        }
        let mut seqs = seqs.to_vec();
        seqs.sort_unstable();
        seqs.dedup();
        let seq_set = sequence_set(&seqs);

        let store_stream = self.session.store(&seq_set, "-FLAGS (\\Seen)").await?;
        let _store_results: Vec<_> = store_stream.collect::<Vec<_>>().await;
        info!("↩️ {} email(s) left unread for the next check", seqs.len());
        Ok(())
    }

    /// Holds an IDLE until the server reports a change or `timeout` elapses.
    pub async fn idle(self, timeout: Duration) -> Result<(Self, IdleWake), ImapError> {
        let mut handle = self.session.idle();
        handle.init().await?;

        let response = {
            let (wait, _interrupt) = handle.wait_with_timeout(timeout);
            wait.await?
        };

        let wake = match response {
            IdleResponse::NewData(_) => IdleWake::NewData,
            IdleResponse::Timeout | IdleResponse::ManualInterrupt => IdleWake::Timeout,
        };

        let session = handle.done().await?;
        Ok((ImapClient { session }, wake))
    }

    pub async fn logout(mut self) -> Result<(), ImapError> {
        info!("Disconnecting from IMAP server");
        self.session.logout().await?;
        Ok(())
    }
}

async fn with_timeout<T, F>(stage: &'static str, after: Duration, fut: F) -> Result<T, ImapError>
where
    F: Future<Output = Result<T, ImapError>>,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| ImapError::Timeout { stage, after })?
}

/// Compresses sorted sequence numbers into an IMAP set, e.g. `1:3,7`.
pub fn sequence_set(sorted: &[u32]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut iter = sorted.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while let Some(&next) = iter.peek() {
            if next == end + 1 {
                end = next;
                iter.next();
            } else {
                break;
            }
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}:{}", start, end));
        }
    }
    parts.join(",")
}
