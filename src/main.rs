//! dbhttpd
//!
//! Serves HTTP from handlers stored in a database table.
//!
//! # Architecture Overview
//!
//! ```text
//!   control plane (MemoryHost)
//!     insert/update/delete ──▶ validate SQL ──▶ commit
//!                                                 │ notify + bump
//!                                                 ▼
//!   ┌───────────────────────── supervisor ─────────────────────────┐
//!   │ reload cycle: read table → snapshot vN+1 → reconcile sockets │
//!   │               → publish → reconfigure / drain workers        │
//!   └──────────────┬──────────────────────────────┬────────────────┘
//!                  │ dup'd listeners              │ ArcSwap snapshot
//!                  ▼                              ▼
//!   ┌──── worker thread ────┐  ┌──── worker thread ────┐   ...
//!   │ accept → resolve →    │  │ accept → resolve →    │
//!   │ execute → response    │  │ execute → response    │
//!   └───────────────────────┘  └───────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;

use dbhttpd::config::{load_config, ConfigWatcher, HttpdConfig};
use dbhttpd::coordination::{NotificationChannel, ReloadSemaphore};
use dbhttpd::handlers::SnapshotPublisher;
use dbhttpd::host::{ConstantExecutor, MemoryHost};
use dbhttpd::lifecycle::{signals, Shutdown};
use dbhttpd::net::SocketRegistry;
use dbhttpd::observability::{logging, metrics};
use dbhttpd::{Supervisor, SupervisorDeps};

#[derive(Debug, Parser)]
#[command(name = "dbhttpd", version, about = "Database-driven HTTP worker fleet")]
struct Cli {
    /// TOML configuration file; watched for changes while running.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and handler queries, then exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("dbhttpd: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => HttpdConfig::default(),
    };

    logging::init_logging(&config.observability);

    let result = if cli.check {
        check(&config)
    } else {
        run(cli, config).await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "dbhttpd failed");
            ExitCode::FAILURE
        }
    }
}

/// Dry run of everything a start would validate.
fn check(config: &HttpdConfig) -> dbhttpd::Result<()> {
    let host = MemoryHost::new(
        NotificationChannel::configuration_reload(),
        Arc::new(ReloadSemaphore::anonymous()?),
    );
    host.replace_all(config.handlers.clone())?;
    tracing::info!(
        handlers = config.handlers.len(),
        http_workers = config.worker_count(),
        "Configuration OK"
    );
    Ok(())
}

async fn run(cli: Cli, config: HttpdConfig) -> dbhttpd::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        database = %config.fleet.database,
        http_workers = config.worker_count(),
        "dbhttpd starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let semaphore = match ReloadSemaphore::open(&config.fleet.database) {
        Ok(semaphore) => semaphore,
        Err(e) => {
            tracing::warn!(error = %e, "Shared reload semaphore unavailable, using a private one");
            ReloadSemaphore::anonymous()?
        }
    };
    let semaphore = Arc::new(semaphore);
    let channel = NotificationChannel::configuration_reload();
    let host = Arc::new(MemoryHost::new(channel.clone(), semaphore.clone()));
    let listener = channel.subscribe();
    host.replace_all(config.handlers.clone())?;

    let shutdown = Shutdown::new();
    let (reload_tx, reload_rx) = mpsc::unbounded_channel();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signals::listen(signal_shutdown, reload_tx).await {
            tracing::error!(error = %e, "Failed to install signal handlers");
        }
    });

    let deps = SupervisorDeps {
        store: host.clone(),
        executor: Arc::new(ConstantExecutor),
        channel: listener,
        semaphore,
    };
    let mut supervisor = Supervisor::new(
        config.clone(),
        SocketRegistry::new(config.listener.clone()),
        SnapshotPublisher::default(),
        deps,
    )
    .with_reload_requests(reload_rx);

    // Keep the watcher alive for the lifetime of the supervisor.
    let _watcher = match &cli.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let watcher = watcher.run()?;
            let (forward_tx, forward_rx) = mpsc::unbounded_channel();
            let host = host.clone();
            tokio::spawn(async move {
                while let Some(config) = updates.recv().await {
                    if let Err(e) = host.replace_all(config.handlers.clone()) {
                        tracing::error!(error = %e, "Handlers from config file rejected");
                    }
                    if forward_tx.send(config).is_err() {
                        break;
                    }
                }
            });
            supervisor = supervisor.with_config_updates(forward_rx);
            Some(watcher)
        }
        None => None,
    };

    supervisor.run(shutdown.subscribe()).await;
    tracing::info!("Shutdown complete");
    Ok(())
}
