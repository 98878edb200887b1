//! Mail access capability consumed by the watcher.

use crate::config::AccountConfig;
use crate::message::{MailboxStatus, MessageRecord, PartPath, Uid};
use async_trait::async_trait;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::Notify;

pub mod imap;

/// Capability token a server advertises when it supports long polling.
pub const LONG_POLL_CAPABILITY: &str = "IDLE";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("could not connect: {0}")]
    Connect(String),

    #[error("login rejected: {0}")]
    Login(String),

    /// The server answered NO or BAD; the connection is still usable.
    #[error("command refused: {0}")]
    Refused(String),

    /// The server's answer lacked the data that was asked for.
    #[error("missing in response: {0}")]
    Missing(String),

    #[error("connection lost: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not logged in")]
    NotAuthenticated,
}

impl ClientError {
    /// Whether the connection can no longer be used after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ClientError::Refused(_) | ClientError::Missing(_))
    }
}

/// How a long poll ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The server announced a new message.
    NewMail,
    /// The wait was ended through a [`WaitCanceller`].
    Cancelled,
    /// The protocol-level refresh interval elapsed.
    Timeout,
    /// The server pushed something that is not a new message.
    Other,
}

/// Handle that ends a long poll from outside the task that is waiting.
///
/// Cancelling while nobody waits is remembered and ends the next wait
/// immediately.
#[derive(Debug, Clone, Default)]
pub struct WaitCanceller(Arc<Notify>);

impl WaitCanceller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.notify_one();
    }

    pub async fn cancelled(&self) {
        self.0.notified().await;
    }
}

/// Flag a client raises once its connection is gone. Clones share the flag,
/// so it can be read while the client is busy inside a request.
#[derive(Debug, Clone, Default)]
pub struct LinkState(Arc<AtomicBool>);

impl LinkState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_lost(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_lost(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Opens connections for an account.
#[async_trait]
pub trait MailConnector: Send + Sync + 'static {
    type Client: MailClient;

    async fn connect(&self, account: &AccountConfig) -> Result<Self::Client, ClientError>;
}

/// One connection to a mail server.
#[async_trait]
pub trait MailClient: Send + 'static {
    async fn login(&mut self, user: &str, password: &str) -> Result<(), ClientError>;

    async fn select(&mut self, mailbox: &str) -> Result<(), ClientError>;

    async fn capabilities(&mut self) -> Result<HashSet<String>, ClientError>;

    /// UIDs of the selected mailbox matching `criteria`.
    async fn search(&mut self, criteria: &str) -> Result<Vec<Uid>, ClientError>;

    /// Envelope and structural description of each message.
    async fn fetch(&mut self, uids: &[Uid]) -> Result<Vec<MessageRecord>, ClientError>;

    /// Raw bytes of a single body part, without marking the message read.
    async fn fetch_part(&mut self, uid: Uid, path: &PartPath) -> Result<Vec<u8>, ClientError>;

    /// Blocks until the server signals an event or `cancel` fires. The
    /// connection is usable again once this returns `Ok`.
    async fn long_poll(&mut self, cancel: &WaitCanceller) -> Result<WaitOutcome, ClientError>;

    /// Lightweight probe of the selected mailbox.
    async fn poll_now(&mut self) -> Result<MailboxStatus, ClientError>;

    /// Shared view of this connection's health.
    fn link(&self) -> LinkState;

    async fn logout(&mut self) -> Result<(), ClientError>;
}
