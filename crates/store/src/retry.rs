//! Bounded retries with jittered backoff for store operations.

use leon_domain::Result;
use rand::Rng;
use std::time::Duration;

/// Base backoff doubled per attempt, plus up to 50% random jitter.
fn backoff(attempt: u32) -> Duration {
    let base_ms = 25u64.saturating_mul(1 << attempt.min(6));
    let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + jitter_ms)
}

/// Run `op` up to `attempts` times, sleeping a jittered backoff between
/// retryable failures. Non-retryable errors return immediately.
pub async fn with_retries<T, F>(label: &str, attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = backoff(attempt);
                tracing::warn!(
                    op = label,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying store operation"
                );
                tokio::time::sleep(delay).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    // Unreachable unless attempts == 0 after the max(1) clamp; keep the
    // last error for completeness.
    Err(last_err.unwrap_or_else(|| leon_domain::Error::Fatal(format!("{label}: no attempts"))))
}
