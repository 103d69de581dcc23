//! Retry backoff with full jitter
//!
//! Shared by the session supervisor (reconnect pacing), the batch writer
//! (write retries) and any other component that retries transient I/O.

use rand::Rng;
use std::time::Duration;

/// Calculate exponential backoff with full jitter
///
/// Formula: `rand(0, min(base * 2^attempt, max))`. Full jitter spreads
/// concurrent retries across the whole interval instead of clustering them
/// at the cap.
///
/// # Arguments
///
/// * `attempt` - Current attempt number (0-indexed)
/// * `base` - Base delay (first attempt draws from `0..base`... doubled per attempt)
/// * `max` - Ceiling on the un-jittered delay
pub fn full_jitter_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base
        .as_millis()
        .saturating_mul(1u128 << attempt.min(20) as u128);
    let capped = exp.min(max.as_millis()).max(1) as u64;

    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=capped))
}

/// Classify an HTTP status for retry purposes
///
/// # Returns
///
/// * `true` - Transient (no status / 429 / 5xx), should retry
/// * `false` - Permanent, don't retry
pub fn is_retryable_status(status: Option<u16>) -> bool {
    match status {
        // No status (network error, timeout) - retry
        None => true,

        // 2xx - success, don't retry
        Some(s) if (200..300).contains(&s) => false,

        // 429 Too Many Requests - retry after backoff
        Some(429) => true,

        // Other 4xx - permanent
        Some(s) if (400..500).contains(&s) => false,

        // 5xx - server error, retry
        Some(s) if (500..600).contains(&s) => true,

        // Unknown status - retry to be safe
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_stays_within_envelope() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(30);

        for attempt in 0..12 {
            let delay = full_jitter_backoff(attempt, base, max);
            let cap = (100u128 << attempt.min(20)).min(30_000);
            assert!(
                delay.as_millis() <= cap,
                "attempt {attempt}: {delay:?} above cap {cap}ms"
            );
        }
    }

    #[test]
    fn test_backoff_caps_at_max() {
        // Far past the doubling horizon the envelope is exactly the max.
        let delay = full_jitter_backoff(30, Duration::from_secs(5), Duration::from_secs(30));
        assert!(delay <= Duration::from_secs(30));
    }

    #[test]
    fn test_is_retryable_status() {
        assert!(is_retryable_status(None));

        assert!(!is_retryable_status(Some(200)));
        assert!(!is_retryable_status(Some(204)));

        assert!(!is_retryable_status(Some(400)));
        assert!(!is_retryable_status(Some(401)));
        assert!(!is_retryable_status(Some(404)));
        assert!(is_retryable_status(Some(429)));

        assert!(is_retryable_status(Some(500)));
        assert!(is_retryable_status(Some(502)));
        assert!(is_retryable_status(Some(503)));
    }
}
