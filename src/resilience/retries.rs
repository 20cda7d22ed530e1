//! Retry logic.
//!
//! # Responsibilities
//! - Re-run a fallible operation while its error is transient
//! - Space attempts with exponential backoff + jitter
//!
//! # Design Decisions
//! - The caller classifies errors; nothing is retried by default
//! - Attempts are bounded; the last error is returned unchanged

use std::fmt::Display;

use crate::resilience::backoff::calculate_backoff;

/// Bounded retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 2000,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn retry_with_backoff<T, E, F, P>(
    policy: &RetryPolicy,
    mut op: F,
    is_transient: P,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts.max(1) && is_transient(&e) => {
                let delay = calculate_backoff(attempt, policy.base_delay_ms, policy.max_delay_ms);
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
