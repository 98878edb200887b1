use anyhow::{anyhow, Context, Result};
use clap::Parser;
use imapwatch::{
    client::imap::ImapConnector, config::Config, notify::transport_from_config,
    supervisor::Supervisor, watcher::Watcher,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    debug: bool,
}

/// Logs to stderr, or to a daily-rotated file in `log_dir`. The returned
/// guard flushes the file writer when dropped.
fn init_logging(debug: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "imapwatch.log"));
            builder.with_ansi(false).with_writer(writer).init();
            Some(guard)
        }
        None => {
            builder.init();
            None
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let _log_guard = init_logging(args.debug || config.debug, config.log_dir.as_deref());

    let transport =
        transport_from_config(&config.push).context("failed to set up push notifications")?;
    let fallback = charset::Charset::for_label(config.fallback_charset.as_bytes())
        .ok_or_else(|| anyhow!("unknown charset {}", config.fallback_charset))?;

    let connector = Arc::new(ImapConnector);
    let watchers = config
        .accounts
        .into_iter()
        .map(|account| Watcher::new(account, Arc::clone(&connector), Arc::clone(&transport), fallback))
        .collect();

    tracing::info!("start");
    Supervisor::new(
        watchers,
        Duration::from_secs(config.supervisor_interval),
        Duration::from_secs(config.shutdown_grace),
    )
    .run(shutdown_signal())
    .await;
    tracing::info!("bye");
    Ok(())
}
