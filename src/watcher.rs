//! One account's connection, wait loop and unseen-check cycle.

use crate::client::{
    ClientError, LinkState, MailClient, MailConnector, WaitCanceller, WaitOutcome,
    LONG_POLL_CAPABILITY,
};
use crate::config::AccountConfig;
use crate::dedup::DedupCache;
use crate::extract::TextExtractor;
use crate::message::{MessageRecord, Uid};
use crate::notify::{Notifier, PushTransport};
use charset::Charset;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tracing::Instrument;

/// Upper bound for connect, login and the baseline scan.
const START_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("connect: {0}")]
    Connect(#[source] ClientError),

    #[error("login: {0}")]
    Login(#[source] ClientError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("startup did not finish within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Ready,
    LongPolling,
    FallbackPoll,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    LongPoll,
    FallbackPoll,
}

/// State a watcher shares with whoever supervises it.
#[derive(Debug)]
pub struct WatcherStatus {
    state: Mutex<ConnState>,
    mode: Mutex<Option<Mode>>,
    waiting_since: Mutex<Option<Instant>>,
    cache: Mutex<DedupCache>,
    link: Mutex<LinkState>,
    stopping: AtomicBool,
    cycles: AtomicU64,
    generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WatcherStatus {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnState::Disconnected),
            mode: Mutex::new(None),
            waiting_since: Mutex::new(None),
            cache: Mutex::new(DedupCache::new()),
            link: Mutex::new(LinkState::new()),
            stopping: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConnState {
        *lock(&self.state)
    }

    pub fn mode(&self) -> Option<Mode> {
        *lock(&self.mode)
    }

    /// When the current long poll began; `None` outside a long poll.
    pub fn waiting_since(&self) -> Option<Instant> {
        *lock(&self.waiting_since)
    }

    /// Identifiers announced so far, as of the last unseen-check.
    pub fn cache(&self) -> DedupCache {
        lock(&self.cache).clone()
    }

    /// Whether the current connection has been reported lost, even while
    /// the watch task is still inside a request.
    pub fn is_disconnected(&self) -> bool {
        lock(&self.link).is_lost()
    }

    /// Number of completed unseen-check cycles, baseline scans included.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Incremented every time a new watch task is spawned.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnState) {
        *lock(&self.state) = state;
    }

    fn begin_wait(&self) {
        *lock(&self.waiting_since) = Some(Instant::now());
        self.set_state(ConnState::LongPolling);
    }

    fn end_wait(&self) {
        *lock(&self.waiting_since) = None;
        self.set_state(ConnState::Ready);
    }

    fn record_cycle(&self, cache: &DedupCache) {
        *lock(&self.cache) = cache.clone();
        self.cycles.fetch_add(1, Ordering::SeqCst);
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

/// Watches one account. Owns the background task that holds the connection.
pub struct Watcher<C: MailConnector> {
    account: Arc<AccountConfig>,
    label: String,
    connector: Arc<C>,
    notifier: Arc<Notifier>,
    extractor: TextExtractor,
    status: Arc<WatcherStatus>,
    canceller: WaitCanceller,
    task: Option<JoinHandle<Result<(), WatchError>>>,
}

impl<C: MailConnector> Watcher<C> {
    pub fn new(
        account: AccountConfig,
        connector: Arc<C>,
        transport: Arc<dyn PushTransport>,
        fallback_charset: Charset,
    ) -> Self {
        let notifier = Arc::new(Notifier::new(&account, transport));
        let extractor =
            TextExtractor::new(account.subject_length, account.body_length, fallback_charset);
        Self {
            label: account.label(),
            account: Arc::new(account),
            connector,
            notifier,
            extractor,
            status: Arc::new(WatcherStatus::new()),
            canceller: WaitCanceller::new(),
            task: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.account.enabled
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.account.idle_timeout()
    }

    pub fn status(&self) -> &Arc<WatcherStatus> {
        &self.status
    }

    /// Whether the background task exists and has not ended.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Connects, logs in, runs the silent baseline scan and spawns the
    /// wait loop.
    pub async fn start(&mut self) -> Result<(), WatchError> {
        self.status.stopping.store(false, Ordering::SeqCst);
        *lock(&self.status.link) = LinkState::new();
        let span = tracing::info_span!("watcher", account = %self.label);

        let opened = tokio::time::timeout(START_TIMEOUT, self.open().instrument(span.clone())).await;
        let watch = match opened {
            Ok(Ok(watch)) => watch,
            Ok(Err(e)) => {
                let state = match e {
                    WatchError::Login(_) => ConnState::Disconnected,
                    _ => ConnState::Failed,
                };
                self.status.set_state(state);
                return Err(e);
            }
            Err(_) => {
                self.status.set_state(ConnState::Failed);
                return Err(WatchError::Timeout(START_TIMEOUT));
            }
        };

        self.status.generation.fetch_add(1, Ordering::SeqCst);
        self.task = Some(tokio::spawn(watch.run().instrument(span)));
        Ok(())
    }

    async fn open(&self) -> Result<WatchLoop<C::Client>, WatchError> {
        let account = &self.account;
        self.status.set_state(ConnState::Connecting);
        let mut client = self
            .connector
            .connect(account)
            .await
            .map_err(WatchError::Connect)?;
        *lock(&self.status.link) = client.link();
        tracing::info!(server = %account.server, port = account.port, "connected");

        if let Err(e) = client.login(&account.username, &account.password).await {
            tracing::error!(user = %account.username, error = %e, "failed to login");
            return Err(WatchError::Login(e));
        }
        tracing::info!(user = %account.username, "logged in");

        client.select(&account.mailbox).await?;
        tracing::debug!(mailbox = %account.mailbox, "mailbox selected");
        self.status.set_state(ConnState::Ready);

        let mut watch = WatchLoop {
            account: Arc::clone(account),
            client,
            cache: DedupCache::new(),
            extractor: self.extractor,
            notifier: Arc::clone(&self.notifier),
            status: Arc::clone(&self.status),
            canceller: self.canceller.clone(),
            mode: Mode::FallbackPoll,
        };
        watch.check_unseen(false).await?;

        let capabilities = watch.client.capabilities().await?;
        watch.mode = if account.force_poll {
            tracing::info!("long poll disabled by configuration, polling");
            Mode::FallbackPoll
        } else if capabilities.contains(LONG_POLL_CAPABILITY) {
            Mode::LongPoll
        } else {
            tracing::warn!(
                "server does not support {LONG_POLL_CAPABILITY}, polling every {}s",
                account.poll_interval
            );
            Mode::FallbackPoll
        };
        *lock(&self.status.mode) = Some(watch.mode);
        Ok(watch)
    }

    /// Ends the current long poll so that the watcher resyncs and waits again.
    pub fn cancel_wait(&self) {
        tracing::debug!(account = %self.label, "cancelling wait");
        self.canceller.cancel();
    }

    /// Kills the background task without a protocol handshake.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        *lock(&self.status.waiting_since) = None;
        self.status.set_state(ConnState::Disconnected);
    }

    pub async fn restart(&mut self) -> Result<(), WatchError> {
        self.stop().await;
        self.start().await
    }

    /// Asks the task to leave its wait and log out, then gives up after `grace`.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.status.stopping.store(true, Ordering::SeqCst);
        self.canceller.cancel();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                tracing::warn!(account = %self.label, "watcher did not stop in time");
                task.abort();
            }
        }
        self.status.set_state(ConnState::Disconnected);
    }
}

/// The part of a watcher that lives inside its task.
struct WatchLoop<M: MailClient> {
    account: Arc<AccountConfig>,
    client: M,
    cache: DedupCache,
    extractor: TextExtractor,
    notifier: Arc<Notifier>,
    status: Arc<WatcherStatus>,
    canceller: WaitCanceller,
    mode: Mode,
}

impl<M: MailClient> WatchLoop<M> {
    async fn run(mut self) -> Result<(), WatchError> {
        tracing::info!(mode = ?self.mode, "watching");
        let result = match self.mode {
            Mode::LongPoll => self.long_poll_loop().await,
            Mode::FallbackPoll => self.poll_loop().await,
        };
        match result {
            Ok(()) => {
                if let Err(e) = self.client.logout().await {
                    tracing::debug!(error = %e, "logout failed");
                }
                self.status.set_state(ConnState::Disconnected);
                tracing::info!("stopped");
                Ok(())
            }
            Err(e) => {
                self.status.set_state(ConnState::Failed);
                tracing::error!(error = %e, "watcher failed");
                Err(e.into())
            }
        }
    }

    async fn long_poll_loop(&mut self) -> Result<(), ClientError> {
        loop {
            if self.status.is_stopping() {
                return Ok(());
            }
            tracing::debug!("entering IDLE");
            self.status.begin_wait();
            let outcome = self.client.long_poll(&self.canceller).await;
            self.status.end_wait();

            match outcome? {
                WaitOutcome::NewMail => {
                    tracing::debug!("new message announced");
                    self.check_unseen(true).await?;
                }
                WaitOutcome::Cancelled | WaitOutcome::Timeout => {
                    if self.status.is_stopping() {
                        return Ok(());
                    }
                    tracing::debug!("wait ended without an event, resyncing");
                    self.check_unseen(true).await?;
                }
                WaitOutcome::Other => {}
            }
        }
    }

    async fn poll_loop(&mut self) -> Result<(), ClientError> {
        let interval = Duration::from_secs(self.account.poll_interval);
        loop {
            if self.status.is_stopping() {
                return Ok(());
            }
            self.status.set_state(ConnState::FallbackPoll);
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = self.canceller.cancelled() => {}
            }
            if self.status.is_stopping() {
                return Ok(());
            }

            let status = self.client.poll_now().await?;
            if status.needs_check() {
                tracing::debug!(exists = ?status.exists, changed = status.changed, "mailbox changed");
                self.check_unseen(true).await?;
            }
        }
    }

    /// Recomputes the dedup cache from the server's unseen set, notifying for
    /// identifiers not seen before when `notify` is set.
    ///
    /// Problems with single messages or with the push service are logged and
    /// skipped; only connection errors end the cycle early.
    async fn check_unseen(&mut self, notify: bool) -> Result<(), ClientError> {
        tracing::debug!(notify, "checking unseen mail");
        let unseen = self.client.search("UNSEEN").await?;
        let (pending, mut snapshot) = self.cache.partition(&unseen);
        for uid in snapshot.iter() {
            tracing::trace!(uid, "skip, already notified");
        }

        if notify {
            self.announce(&pending, &mut snapshot).await?;
        } else {
            for &uid in &pending {
                snapshot.insert(uid);
            }
        }

        self.cache.replace(snapshot);
        self.status.record_cycle(&self.cache);
        Ok(())
    }

    async fn announce(
        &mut self,
        pending: &[Uid],
        snapshot: &mut DedupCache,
    ) -> Result<(), ClientError> {
        if pending.is_empty() {
            return Ok(());
        }
        let records = self.fetch_records(pending, snapshot).await?;
        for record in records.iter().filter(|record| pending.contains(&record.uid)) {
            let uid = record.uid;
            let summary = self.extractor.extract(&mut self.client, record).await?;
            tracing::info!(uid, subject = %summary.subject, from = %summary.from, "new mail");
            if let Err(e) = self.notifier.notify(&summary).await {
                tracing::warn!(uid, error = %e, "notification failed");
            }
            snapshot.insert(uid);
        }
        for uid in pending.iter().filter(|uid| !snapshot.contains(**uid)) {
            tracing::debug!(uid, "message vanished before it could be fetched");
        }
        Ok(())
    }

    /// Fetches `uids` in one request. When the server refuses the batch,
    /// each message is fetched on its own; messages that are still refused
    /// are recorded without a notification.
    async fn fetch_records(
        &mut self,
        uids: &[Uid],
        snapshot: &mut DedupCache,
    ) -> Result<Vec<MessageRecord>, ClientError> {
        match self.client.fetch(uids).await {
            Ok(records) => return Ok(records),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => tracing::warn!(error = %e, "batch fetch refused, fetching one by one"),
        }

        let mut records = Vec::with_capacity(uids.len());
        for &uid in uids {
            match self.client.fetch(&[uid]).await {
                Ok(mut fetched) => records.append(&mut fetched),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!(uid, error = %e, "could not fetch message, skipping it");
                    snapshot.insert(uid);
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_account;
    use crate::extract::UNPARSEABLE_BODY;
    use crate::testing::{
        eventually, text_message, MockClient, MockConnector, MockServer, RecordingTransport,
    };

    fn watcher(server: &MockServer, transport: &RecordingTransport) -> Watcher<MockConnector> {
        Watcher::new(
            test_account("test"),
            Arc::new(server.connector()),
            Arc::new(transport.clone()),
            Charset::for_label(b"iso-8859-1").unwrap(),
        )
    }

    fn watch_loop(server: &MockServer, transport: &RecordingTransport) -> WatchLoop<MockClient> {
        let account = test_account("test");
        WatchLoop {
            notifier: Arc::new(Notifier::new(&account, Arc::new(transport.clone()))),
            extractor: TextExtractor::new(100, 100, Charset::for_label(b"utf-8").unwrap()),
            account: Arc::new(account),
            client: server.client(),
            cache: DedupCache::new(),
            status: Arc::new(WatcherStatus::new()),
            canceller: WaitCanceller::new(),
            mode: Mode::LongPoll,
        }
    }

    fn cached(watch: &WatchLoop<MockClient>) -> Vec<Uid> {
        watch.cache.iter().collect()
    }

    fn add(server: &MockServer, uid: Uid) {
        server.add_message(text_message(uid, &format!("message {uid}"), "Ann", "hello"));
    }

    #[tokio::test]
    async fn baseline_is_silent_but_fills_cache() {
        let server = MockServer::new();
        let transport = RecordingTransport::new();
        for uid in [3, 5, 8] {
            add(&server, uid);
        }
        let mut watch = watch_loop(&server, &transport);

        watch.check_unseen(false).await.unwrap();

        assert!(transport.events().is_empty());
        assert_eq!(cached(&watch), vec![3, 5, 8]);
        assert_eq!(server.state().fetches, 0);
    }

    #[tokio::test]
    async fn second_cycle_without_changes_is_idempotent() {
        let server = MockServer::new();
        let transport = RecordingTransport::new();
        add(&server, 1);
        add(&server, 2);
        let mut watch = watch_loop(&server, &transport);

        watch.check_unseen(true).await.unwrap();
        assert_eq!(transport.events().len(), 2);
        let first = watch.cache.clone();

        watch.check_unseen(true).await.unwrap();
        assert_eq!(watch.cache, first);
        assert_eq!(transport.events().len(), 2);
        assert_eq!(watch.status.cycles(), 2);
    }

    #[tokio::test]
    async fn resync_forgets_resolved_mail() {
        let server = MockServer::new();
        let transport = RecordingTransport::new();
        for uid in [1, 2, 3] {
            add(&server, uid);
        }
        let mut watch = watch_loop(&server, &transport);
        watch.check_unseen(false).await.unwrap();

        server.mark_seen(1);
        server.expunge(3);
        add(&server, 4);
        watch.check_unseen(true).await.unwrap();

        assert_eq!(cached(&watch), vec![2, 4]);
        assert_eq!(transport.subjects(), vec!["message 4 from: Ann"]);
        assert_eq!(watch.status.cache(), watch.cache);
    }

    #[tokio::test]
    async fn empty_unseen_set_clears_cache() {
        let server = MockServer::new();
        let transport = RecordingTransport::new();
        add(&server, 1);
        let mut watch = watch_loop(&server, &transport);
        watch.check_unseen(false).await.unwrap();

        server.mark_seen(1);
        watch.check_unseen(true).await.unwrap();
        assert!(watch.cache.is_empty());
    }

    #[tokio::test]
    async fn malformed_message_does_not_stop_the_batch() {
        let server = MockServer::new();
        let transport = RecordingTransport::new();
        add(&server, 1);
        let mut broken = text_message(2, "broken", "Eve", "???");
        broken.record.structure = None;
        server.add_message(broken);
        add(&server, 3);
        let mut watch = watch_loop(&server, &transport);

        watch.check_unseen(true).await.unwrap();

        let events = transport.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].description, "hello");
        assert_eq!(events[1].description, UNPARSEABLE_BODY);
        assert_eq!(events[2].description, "hello");
        assert_eq!(cached(&watch), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn refused_batch_fetch_falls_back_to_single_fetches() {
        let server = MockServer::new();
        let transport = RecordingTransport::new();
        for uid in [1, 2, 3] {
            add(&server, uid);
        }
        server.state().refused_fetches.insert(2);
        let mut watch = watch_loop(&server, &transport);

        watch.check_unseen(true).await.unwrap();

        assert_eq!(
            transport.subjects(),
            vec!["message 1 from: Ann", "message 3 from: Ann"]
        );
        assert_eq!(cached(&watch), vec![1, 2, 3]);
        // one refused batch, then one request per message
        assert_eq!(server.state().fetches, 4);
        assert_eq!(watch.status.cycles(), 1);
    }

    #[tokio::test]
    async fn rejected_notification_is_still_recorded() {
        let server = MockServer::new();
        let transport = RecordingTransport::new();
        transport.respond_with("500");
        add(&server, 1);
        let mut watch = watch_loop(&server, &transport);

        watch.check_unseen(true).await.unwrap();
        watch.check_unseen(true).await.unwrap();

        assert_eq!(transport.events().len(), 1);
        assert_eq!(cached(&watch), vec![1]);
    }

    #[tokio::test]
    async fn connection_loss_aborts_the_cycle() {
        let server = MockServer::new();
        let transport = RecordingTransport::new();
        add(&server, 1);
        let mut watch = watch_loop(&server, &transport);
        server.kill_connections();

        let err = watch.check_unseen(true).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(watch.cache.is_empty());
        assert_eq!(watch.status.cycles(), 0);
    }

    #[tokio::test]
    async fn start_runs_baseline_then_notifies_new_mail() {
        let server = MockServer::new();
        let transport = RecordingTransport::new();
        add(&server, 1);
        let mut watcher = watcher(&server, &transport);

        watcher.start().await.unwrap();
        assert!(watcher.is_running());
        assert_eq!(watcher.status().mode(), Some(Mode::LongPoll));
        assert_eq!(watcher.status().generation(), 1);
        assert_eq!(watcher.status().cache().iter().collect::<Vec<_>>(), vec![1]);

        let status = Arc::clone(watcher.status());
        eventually(|| status.state() == ConnState::LongPolling).await;
        assert!(status.waiting_since().is_some());

        server.deliver(text_message(2, "Hello", "Bob", "news"));
        eventually(|| status.cycles() == 2).await;
        assert_eq!(transport.subjects(), vec!["Hello from: Bob"]);
        assert_eq!(status.cache().iter().collect::<Vec<_>>(), vec![1, 2]);

        watcher.shutdown(Duration::from_secs(1)).await;
        assert!(!watcher.is_running());
        assert_eq!(server.state().logouts, 1);
    }

    #[tokio::test]
    async fn unsupported_long_poll_falls_back_to_polling() {
        let server = MockServer::new().without_long_poll();
        let transport = RecordingTransport::new();
        let mut watcher = watcher(&server, &transport);

        watcher.start().await.unwrap();
        assert_eq!(watcher.status().mode(), Some(Mode::FallbackPoll));
        watcher.shutdown(Duration::from_secs(1)).await;
        assert_eq!(server.state().waits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_poll_picks_up_new_mail() {
        let server = MockServer::new();
        let transport = RecordingTransport::new();
        let mut account = test_account("poller");
        account.force_poll = true;
        account.poll_interval = 1;
        let mut watcher = Watcher::new(
            account,
            Arc::new(server.connector()),
            Arc::new(transport.clone()),
            Charset::for_label(b"utf-8").unwrap(),
        );

        watcher.start().await.unwrap();
        assert_eq!(watcher.status().mode(), Some(Mode::FallbackPoll));
        add(&server, 9);

        let status = Arc::clone(watcher.status());
        eventually(|| status.cycles() == 2).await;
        assert_eq!(transport.subjects(), vec!["message 9 from: Ann"]);
        assert!(server.state().polls >= 1);
        assert_eq!(server.state().waits, 0);
        watcher.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_poll_checks_only_after_a_change() {
        let server = MockServer::new();
        let transport = RecordingTransport::new();
        add(&server, 1);
        let mut account = test_account("quiet");
        account.force_poll = true;
        account.poll_interval = 1;
        let mut watcher = Watcher::new(
            account,
            Arc::new(server.connector()),
            Arc::new(transport.clone()),
            Charset::for_label(b"utf-8").unwrap(),
        );
        watcher.start().await.unwrap();
        let status = Arc::clone(watcher.status());

        eventually(|| server.state().polls >= 3).await;
        assert_eq!(status.cycles(), 1);
        assert_eq!(server.state().searches, 1);

        server.mark_seen(1);
        eventually(|| status.cycles() == 2).await;
        assert!(status.cache().is_empty());
        assert!(transport.events().is_empty());
        watcher.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn login_failure_leaves_watcher_unstarted() {
        let server = MockServer::new();
        server.state().reject_logins = true;
        let transport = RecordingTransport::new();
        let mut watcher = watcher(&server, &transport);

        let err = watcher.start().await.unwrap_err();
        assert!(matches!(err, WatchError::Login(_)));
        assert!(!watcher.is_running());
        assert_eq!(watcher.status().state(), ConnState::Disconnected);
        assert_eq!(watcher.status().generation(), 0);
    }

    #[tokio::test]
    async fn wait_failure_marks_watcher_failed() {
        let server = MockServer::new();
        let transport = RecordingTransport::new();
        let mut watcher = watcher(&server, &transport);
        watcher.start().await.unwrap();

        let status = Arc::clone(watcher.status());
        eventually(|| status.state() == ConnState::LongPolling).await;
        server.kill_connections();

        eventually(|| status.state() == ConnState::Failed).await;
        eventually(|| !watcher.is_running()).await;
        assert!(status.is_disconnected());
    }
}
