//! Exponential backoff with jitter for bind retries.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `attempt` (1-based); attempt 0 has no delay.
///
/// `base_ms * 2^(attempt - 1)`, capped at `max_ms`, plus up to 10% jitter so
/// workers restarted together do not hammer the same port in lockstep.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
    let capped = base_ms.saturating_mul(factor).min(max_ms);

    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped + jitter)
}
