//! Shared utilities for the client crate.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff delay with jitter.
///
/// `initial_ms * 2^(attempt-1)` capped at `max_ms`, with +/- 25% jitter.
pub fn backoff_delay(attempt: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let base = initial_ms.saturating_mul(1u64 << attempt.min(16).saturating_sub(1));
    let capped = base.min(max_ms);
    let jitter_range = capped / 4;
    let random_offset = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..=(jitter_range * 2))
    } else {
        0
    };
    Duration::from_millis((capped.saturating_sub(jitter_range) + random_offset).min(max_ms))
}

/// Sleep for [`backoff_delay`].
pub async fn backoff(attempt: u32, initial_ms: u64, max_ms: u64) {
    tokio::time::sleep(backoff_delay(attempt, initial_ms, max_ms)).await;
}
