//! Process lifecycle.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → supervisor stops reloading → workers drain → sockets close
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → graceful shutdown (a second one exits immediately)
//!     SIGHUP → reload edge
//! ```
//!
//! # Design Decisions
//! - Shutdown is bounded by the drain timeout; stragglers are terminated

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
