//! In-memory mail server and push transport for tests.

use crate::client::{
    ClientError, LinkState, MailClient, MailConnector, WaitCanceller, WaitOutcome,
};
use crate::config::AccountConfig;
use crate::message::{Address, BodyPart, MailboxStatus, MessageRecord, Part, PartPath, Uid};
use crate::notify::{NotifyError, PushEvent, PushTransport};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub record: MessageRecord,
    /// Part bytes keyed by part path, e.g. `"1.2"`.
    pub parts: HashMap<String, Vec<u8>>,
}

/// A plain single-part text message from `name <lowercase name@example.org>`.
pub fn text_message(uid: Uid, subject: &str, name: &str, body: &str) -> MockMessage {
    let record = MessageRecord {
        uid,
        subject: Some(subject.as_bytes().to_vec()),
        from: vec![Address {
            name: Some(name.as_bytes().to_vec()),
            mailbox: Some(name.to_lowercase().into_bytes()),
            host: Some(b"example.org".to_vec()),
        }],
        structure: Some(BodyPart::Leaf(
            Part::new("text", "plain").with_encoding("7bit"),
        )),
    };
    let parts = HashMap::from([("1".to_string(), body.as_bytes().to_vec())]);
    MockMessage { record, parts }
}

#[derive(Debug, Default)]
pub struct ServerState {
    pub capabilities: HashSet<String>,
    pub messages: BTreeMap<Uid, MockMessage>,
    pub unseen: BTreeSet<Uid>,
    pub refuse_connections: bool,
    pub reject_logins: bool,
    /// Number of upcoming logins that fail before logins succeed again.
    pub failing_logins: usize,
    /// A fetch naming any of these UIDs is answered with NO.
    pub refused_fetches: BTreeSet<Uid>,
    /// Accounts, by label, whose connection attempts never complete.
    pub hanging_accounts: HashSet<String>,
    pub links: Vec<LinkState>,
    pub epoch: u64,
    pub connect_attempts: usize,
    pub connects: usize,
    pub logins: usize,
    pub searches: usize,
    pub fetches: usize,
    pub waits: usize,
    pub polls: usize,
    pub logouts: usize,
}

/// Shared handle to a scripted server.
#[derive(Debug, Clone)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
    events: Arc<Notify>,
    kills: Arc<Notify>,
}

impl MockServer {
    pub fn new() -> Self {
        let state = ServerState {
            capabilities: ["IMAP4rev1", "IDLE"].iter().map(|c| c.to_string()).collect(),
            ..ServerState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            events: Arc::new(Notify::new()),
            kills: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            server: self.clone(),
        }
    }

    /// A client that is already logged in with the mailbox selected.
    pub fn client(&self) -> MockClient {
        let mut state = self.state();
        MockClient::attach(self.clone(), &mut state, true)
    }

    pub fn without_long_poll(self) -> Self {
        self.state().capabilities.remove("IDLE");
        self
    }

    /// Stores an unseen message without telling anyone.
    pub fn add_message(&self, message: MockMessage) {
        let mut state = self.state();
        state.unseen.insert(message.record.uid);
        state.messages.insert(message.record.uid, message);
    }

    /// Stores an unseen message and announces it to a waiting client.
    pub fn deliver(&self, message: MockMessage) {
        self.add_message(message);
        self.events.notify_one();
    }

    pub fn mark_seen(&self, uid: Uid) {
        self.state().unseen.remove(&uid);
    }

    pub fn expunge(&self, uid: Uid) {
        let mut state = self.state();
        state.unseen.remove(&uid);
        state.messages.remove(&uid);
    }

    /// Breaks every open connection.
    pub fn kill_connections(&self) {
        self.drop_connections_silently();
        self.kills.notify_waiters();
    }

    /// Breaks every open connection without waking clients that are
    /// blocked in a long poll.
    pub fn drop_connections_silently(&self) {
        let mut state = self.state();
        state.epoch += 1;
        for link in state.links.drain(..) {
            link.mark_lost();
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockConnector {
    server: MockServer,
}

#[async_trait]
impl MailConnector for MockConnector {
    type Client = MockClient;

    async fn connect(&self, account: &AccountConfig) -> Result<MockClient, ClientError> {
        let hang = {
            let mut state = self.server.state();
            state.connect_attempts += 1;
            state.hanging_accounts.contains(&account.label())
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.server.state();
        if state.refuse_connections {
            return Err(ClientError::Connect("connection refused".to_string()));
        }
        state.connects += 1;
        Ok(MockClient::attach(self.server.clone(), &mut state, false))
    }
}

#[derive(Debug)]
pub struct MockClient {
    server: MockServer,
    epoch: u64,
    link: LinkState,
    authenticated: bool,
    logged_out: bool,
    /// Highest UID and unseen set as of the last probe.
    last_max: Option<Uid>,
    last_unseen: BTreeSet<Uid>,
}

impl MockClient {
    fn attach(server: MockServer, state: &mut ServerState, authenticated: bool) -> Self {
        let link = LinkState::new();
        state.links.push(link.clone());
        Self {
            server,
            epoch: state.epoch,
            link,
            authenticated,
            logged_out: false,
            last_max: state.messages.keys().next_back().copied(),
            last_unseen: state.unseen.clone(),
        }
    }

    fn live(&self) -> Result<MutexGuard<'_, ServerState>, ClientError> {
        let state = self.server.state();
        if self.logged_out || state.epoch != self.epoch {
            self.link.mark_lost();
            return Err(ClientError::Connection("connection reset".to_string()));
        }
        if !self.authenticated {
            return Err(ClientError::NotAuthenticated);
        }
        Ok(state)
    }
}

#[async_trait]
impl MailClient for MockClient {
    async fn login(&mut self, _user: &str, _password: &str) -> Result<(), ClientError> {
        let mut state = self.server.state();
        if state.reject_logins || state.failing_logins > 0 {
            state.failing_logins = state.failing_logins.saturating_sub(1);
            return Err(ClientError::Login("authentication failed".to_string()));
        }
        state.logins += 1;
        self.authenticated = true;
        Ok(())
    }

    async fn select(&mut self, _mailbox: &str) -> Result<(), ClientError> {
        self.live().map(drop)
    }

    async fn capabilities(&mut self) -> Result<HashSet<String>, ClientError> {
        Ok(self.live()?.capabilities.clone())
    }

    async fn search(&mut self, criteria: &str) -> Result<Vec<Uid>, ClientError> {
        assert_eq!(criteria, "UNSEEN");
        let mut state = self.live()?;
        state.searches += 1;
        Ok(state.unseen.iter().copied().collect())
    }

    async fn fetch(&mut self, uids: &[Uid]) -> Result<Vec<MessageRecord>, ClientError> {
        let mut state = self.live()?;
        state.fetches += 1;
        if uids.iter().any(|uid| state.refused_fetches.contains(uid)) {
            return Err(ClientError::Refused(
                "Some messages could not be FETCHed".to_string(),
            ));
        }
        Ok(uids
            .iter()
            .filter_map(|uid| state.messages.get(uid))
            .map(|message| message.record.clone())
            .collect())
    }

    async fn fetch_part(&mut self, uid: Uid, path: &PartPath) -> Result<Vec<u8>, ClientError> {
        let state = self.live()?;
        state
            .messages
            .get(&uid)
            .and_then(|message| message.parts.get(&path.to_string()))
            .cloned()
            .ok_or_else(|| ClientError::Missing(format!("BODY[{path}] of UID {uid}")))
    }

    async fn long_poll(&mut self, cancel: &WaitCanceller) -> Result<WaitOutcome, ClientError> {
        self.live()?.waits += 1;
        let events = self.server.events.clone();
        let kills = self.server.kills.clone();
        let outcome = tokio::select! {
            () = events.notified() => WaitOutcome::NewMail,
            () = cancel.cancelled() => WaitOutcome::Cancelled,
            () = kills.notified() => {
                return Err(ClientError::Connection("connection reset".to_string()));
            }
        };
        self.live()?;
        Ok(outcome)
    }

    async fn poll_now(&mut self) -> Result<MailboxStatus, ClientError> {
        let (max, exists, unseen) = {
            let mut state = self.live()?;
            state.polls += 1;
            let max = state.messages.keys().next_back().copied();
            (max, state.messages.len() as u32, state.unseen.clone())
        };
        let status = MailboxStatus {
            exists: (max > self.last_max).then_some(exists),
            changed: unseen != self.last_unseen,
        };
        self.last_max = max;
        self.last_unseen = unseen;
        Ok(status)
    }

    fn link(&self) -> LinkState {
        self.link.clone()
    }

    async fn logout(&mut self) -> Result<(), ClientError> {
        self.live()?.logouts += 1;
        self.logged_out = true;
        self.link.mark_lost();
        Ok(())
    }
}

/// Push transport that remembers every event and answers with a fixed code.
#[derive(Debug, Clone)]
pub struct RecordingTransport {
    events: Arc<Mutex<Vec<PushEvent>>>,
    code: Arc<Mutex<String>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            events: Arc::default(),
            code: Arc::new(Mutex::new("200".to_string())),
        }
    }

    pub fn respond_with(&self, code: &str) {
        *self.code.lock().unwrap() = code.to_string();
    }

    pub fn events(&self) -> Vec<PushEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.events().into_iter().map(|event| event.event).collect()
    }
}

#[async_trait]
impl PushTransport for RecordingTransport {
    async fn post(&self, event: &PushEvent) -> Result<String, NotifyError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(self.code.lock().unwrap().clone())
    }
}

/// Polls `condition` until it holds, failing the test after a while.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was never met");
}
