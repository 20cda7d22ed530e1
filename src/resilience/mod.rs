//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Bind of a listening socket:
//!     → retries.rs (classify error, retry transient ones)
//!     → backoff.rs (exponential delay with jitter between attempts)
//! ```
//!
//! # Design Decisions
//! - Only infrastructure operations are retried; handler SQL never is
//! - Jittered backoff prevents thundering herd

pub mod backoff;
pub mod retries;

pub use backoff::calculate_backoff;
pub use retries::{retry_with_backoff, RetryPolicy};
