//! Configuration file watcher for hot reload.
//!
//! Watches the file's directory rather than the file itself so editors that
//! save by rename still produce events. Only configurations that load,
//! validate, and differ from the last one sent are forwarded.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::{load_config, ConfigError};
use crate::config::schema::HttpdConfig;

pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<HttpdConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for validated configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<HttpdConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching on notify's background thread.
    ///
    /// The returned watcher must be kept alive for updates to flow.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self.path.file_name().map(OsString::from);
        let path = self.path.clone();
        let tx = self.update_tx;
        let mut last_sent = load_config(&path).ok();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !(event.kind.is_modify() || event.kind.is_create()) {
                        return;
                    }
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(OsString::from) == file_name);
                    if !ours {
                        return;
                    }

                    match load_config(&path) {
                        Ok(config) if last_sent.as_ref() == Some(&config) => {
                            tracing::debug!(path = ?path, "Config file touched without changes");
                        }
                        Ok(config) => {
                            tracing::info!(path = ?path, "Config file changed, applying");
                            last_sent = Some(config.clone());
                            let _ = tx.send(config);
                        }
                        Err(ConfigError::Validation(errors)) => {
                            for error in &errors {
                                tracing::error!(error = %error, "Invalid config value");
                            }
                            tracing::error!(
                                errors = errors.len(),
                                "Config file rejected. Keeping current configuration."
                            );
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to reload config. Keeping current configuration.");
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&directory, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}
