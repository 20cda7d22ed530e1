//! Reload signalling between the control plane and the supervisor.
//!
//! # Data Flow
//! ```text
//! handler table commit
//!     → channel.rs notify()        (fast path, may be missed)
//!     → semaphore.rs bump()        (backstop, sampled on a timer)
//!     → supervisor observes a ReloadEdge
//! ```

pub mod channel;
pub mod semaphore;

use std::fmt;

pub use channel::{ChannelListener, NotificationChannel, CONFIGURATION_RELOAD_CHANNEL};
pub use semaphore::{ReloadSemaphore, SemaphoreError, SemaphoreSampler};

/// What caused a reload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadEdge {
    Startup,
    Notification,
    Semaphore,
    ConfigFile,
    Signal,
}

impl ReloadEdge {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadEdge::Startup => "startup",
            ReloadEdge::Notification => "notification",
            ReloadEdge::Semaphore => "semaphore",
            ReloadEdge::ConfigFile => "config_file",
            ReloadEdge::Signal => "signal",
        }
    }
}

impl fmt::Display for ReloadEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
