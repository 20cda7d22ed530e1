//! Crate-level error type.
//!
//! Each subsystem owns a `thiserror` enum; `Error` folds them for callers
//! that sit above more than one subsystem, such as the binary.

use crate::config::ConfigError;
use crate::coordination::SemaphoreError;
use crate::handlers::ValidationError;
use crate::host::{ExecutionError, HostError};
use crate::net::SocketError;
use crate::response::UnsupportedBodyType;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error("handler runtime error: {0}")]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    UnsupportedBody(#[from] UnsupportedBodyType),

    /// Shared state the fleet cannot run without.
    #[error("fatal: {0}")]
    Fatal(#[from] SemaphoreError),

    #[error("config watcher: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
