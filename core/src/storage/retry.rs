//! A shared retry schedule: 3 attempts, sleeping `1s, 3s, 5s` between them
//! (`1s + 2s * attempt_index`). Ported from the Go original's
//! `psql/retry.go` / `fileio/retry.go`, which both use this exact schedule
//! for connection-exception and disk-retry handling respectively.

use std::future::Future;
use std::time::Duration;

pub const MAX_RETRIES: u32 = 3;

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1) + Duration::from_secs(2) * attempt
}

/// Runs `op` up to [`MAX_RETRIES`] times, sleeping `backoff(attempt)` between
/// attempts whenever `should_retry` returns true for the error. The last
/// error is returned if every attempt is exhausted.
pub async fn retry<T, E, F, Fut, ShouldRetry>(
    should_retry: ShouldRetry,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: Fn(&E) -> bool,
{
    let mut last_err = None;
    for attempt in 0..MAX_RETRIES {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !should_retry(&err) {
                    return Err(err);
                }
                tracing::warn!(attempt, "retryable operation failed, backing off");
                last_err = Some(err);
                tokio::time::sleep(backoff(attempt)).await;
            }
        }
    }
    Err(last_err.expect("at least one attempt runs"))
}
