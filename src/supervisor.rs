//! Keeps every watcher alive.

use crate::client::MailConnector;
use crate::watcher::{ConnState, Watcher};
use futures::future::join_all;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Restart attempts per watcher and tick: the first try plus one retry.
const RESTART_ATTEMPTS: u32 = 2;

pub struct Supervisor<C: MailConnector> {
    watchers: Vec<Watcher<C>>,
    interval: Duration,
    grace: Duration,
}

impl<C: MailConnector> Supervisor<C> {
    pub fn new(watchers: Vec<Watcher<C>>, interval: Duration, grace: Duration) -> Self {
        Self {
            watchers,
            interval,
            grace,
        }
    }

    pub fn watchers(&self) -> &[Watcher<C>] {
        &self.watchers
    }

    /// Starts every enabled watcher. Failures are left to the next tick.
    pub async fn start_all(&mut self) {
        join_all(self.watchers.iter_mut().map(start)).await;
    }

    /// Inspects every enabled watcher once. Watchers are inspected side by
    /// side, so a slow restart does not hold up the others.
    pub async fn tick(&mut self) {
        let enabled = self.watchers.iter_mut().filter(|w| w.is_enabled());
        join_all(enabled.map(inspect)).await;
    }

    /// Starts the watchers and supervises them until `shutdown` resolves.
    /// The signal is honoured even in the middle of a start or a tick.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let interval = self.interval;
        let supervise = async {
            self.start_all().await;
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        };
        tokio::select! {
            _ = supervise => {}
            () = shutdown => {}
        }

        tracing::info!("shutting down");
        self.shutdown().await;
    }

    /// Cancels every wait and gives the watchers `grace` to finish cleanly.
    pub async fn shutdown(&mut self) {
        let grace = self.grace;
        join_all(self.watchers.iter_mut().map(|w| w.shutdown(grace))).await;
    }
}

async fn start<C: MailConnector>(watcher: &mut Watcher<C>) {
    if !watcher.is_enabled() {
        tracing::info!(account = %watcher.label(), "account disabled, not watching");
        return;
    }
    tracing::info!(account = %watcher.label(), "starting");
    if let Err(e) = watcher.start().await {
        tracing::error!(account = %watcher.label(), error = %e, "could not start watcher");
    }
}

async fn inspect<C: MailConnector>(watcher: &mut Watcher<C>) {
    let label = watcher.label().to_string();
    let status = Arc::clone(watcher.status());

    if !watcher.is_running() {
        match status.state() {
            ConnState::Failed => {
                tracing::error!(account = %label, "socket is disconnected, trying to reconnect")
            }
            _ => tracing::warn!(account = %label, "watcher is not running, restarting"),
        }
        restart(watcher).await;
        return;
    }

    if status.is_disconnected() {
        tracing::warn!(account = %label, "connection reports disconnected, restarting");
        watcher.stop().await;
        restart(watcher).await;
        return;
    }

    if let (Some(timeout), Some(since)) = (watcher.idle_timeout(), status.waiting_since()) {
        if since.elapsed() >= timeout {
            tracing::debug!(account = %label, waited = ?since.elapsed(), "long poll idle too long, refreshing");
            watcher.cancel_wait();
        }
    }
}

async fn restart<C: MailConnector>(watcher: &mut Watcher<C>) {
    for attempt in 1..=RESTART_ATTEMPTS {
        match watcher.restart().await {
            Ok(()) => {
                tracing::info!(account = %watcher.label(), "restarted");
                return;
            }
            Err(e) => {
                tracing::error!(account = %watcher.label(), attempt, error = %e, "restart failed");
            }
        }
    }
}
