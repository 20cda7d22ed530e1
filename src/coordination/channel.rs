//! Notification channel for configuration reloads.
//!
//! A payload-less, named pub/sub channel. Delivery is best effort: a
//! listener that lags behind still observes one wakeup, and the reload
//! semaphore catches anything a listener misses entirely.

use std::sync::Arc;

use tokio::sync::broadcast;

/// Name of the channel the control plane notifies after handler changes.
pub const CONFIGURATION_RELOAD_CHANNEL: &str = "dbhttpd_configuration_reload";

const CHANNEL_CAPACITY: usize = 16;

/// A named notification channel.
#[derive(Debug, Clone)]
pub struct NotificationChannel {
    name: Arc<str>,
    tx: broadcast::Sender<()>,
}

impl NotificationChannel {
    pub fn new(name: &str) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            name: Arc::from(name),
            tx,
        }
    }

    /// The configuration reload channel.
    pub fn configuration_reload() -> Self {
        Self::new(CONFIGURATION_RELOAD_CHANNEL)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wake every listener. Returns how many listeners were subscribed.
    pub fn notify(&self) -> usize {
        match self.tx.send(()) {
            Ok(listeners) => listeners,
            Err(_) => {
                tracing::trace!(channel = %self.name, "Notification with no listeners");
                0
            }
        }
    }

    pub fn subscribe(&self) -> ChannelListener {
        ChannelListener {
            name: self.name.clone(),
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving end of a [`NotificationChannel`].
#[derive(Debug)]
pub struct ChannelListener {
    name: Arc<str>,
    rx: broadcast::Receiver<()>,
}

impl ChannelListener {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next notification. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<()> {
        match self.rx.recv().await {
            Ok(()) => Some(()),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(channel = %self.name, skipped, "Notification listener lagged");
                Some(())
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Discard queued notifications. Returns how many were pending.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        loop {
            match self.rx.try_recv() {
                Ok(()) => drained += 1,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => drained += skipped as usize,
                Err(_) => return drained,
            }
        }
    }
}
