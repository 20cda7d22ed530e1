//! OS signal handling.
//!
//! # Responsibilities
//! - Register SIGTERM, SIGINT and SIGHUP handlers
//! - Translate them into shutdown or reload edges
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A second SIGTERM/SIGINT exits without waiting for the drain
//! - SIGHUP triggers a reload cycle, not a config re-read

use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::coordination::ReloadEdge;
use crate::lifecycle::Shutdown;

/// Exit status used when a second termination signal arrives mid-drain.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Listen for signals until the process exits.
pub async fn listen(shutdown: Shutdown, reload: mpsc::UnboundedSender<ReloadEdge>) -> io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut stopping = false;

    loop {
        let name = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
            _ = hangup.recv() => {
                tracing::info!("SIGHUP received, requesting reload");
                if reload.send(ReloadEdge::Signal).is_err() {
                    tracing::warn!("Supervisor gone, ignoring SIGHUP");
                }
                continue;
            }
        };

        if stopping {
            tracing::warn!(signal = name, "Second termination signal, exiting now");
            std::process::exit(FORCED_EXIT_CODE);
        }
        tracing::info!(signal = name, "Shutdown requested");
        stopping = true;
        shutdown.trigger();
    }
}
