//! Fail-open and retry helpers
//!
//! `fail_open` is for side channels that must never affect orchestration
//! state, such as event publication. `retry_with_backoff` is for operations
//! that must eventually succeed or propagate, such as checkpoint writes.
//!
//! DO NOT use fail-open for:
//! - Checkpoint writes (the store is the source of truth)
//! - Shard execution (failures drive the retry state machine)
//! - Merkle certification

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// ```no_run
/// use hxo_core::fail_open::fail_open;
/// use hxo_core::Result;
///
/// async fn publish() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let published = fail_open("notifier", || publish()).await;
///     // published is None if publish() failed
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Run an operation up to `max_attempts` times, sleeping `base * attempt`
/// between attempts, and return the last error if every attempt failed.
pub async fn retry_with_backoff<F, Fut, T>(
    operation_name: &str,
    mut f: F,
    max_attempts: usize,
    base: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if attempt >= max_attempts => {
                warn!(
                    "{} failed after {} attempts: {}",
                    operation_name, max_attempts, e
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, max_attempts, e
                );
                tokio::time::sleep(base * attempt as u32).await;
                attempt += 1;
            }
        }
    }
}

/// Exponential backoff for shard retries: `base * 2^(attempt-1)`, capped.
pub fn exponential_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HxoError;

    #[tokio::test]
    async fn test_fail_open_success() {
        let result = fail_open("test_op", || async { Ok::<_, HxoError>(42) }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_fail_open_failure() {
        let result = fail_open("test_op", || async {
            Err::<i32, _>(HxoError::Other("bus down".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_error() {
        let mut attempts = 0;
        let result = retry_with_backoff(
            "checkpoint",
            || {
                attempts += 1;
                async move {
                    if attempts < 2 {
                        Err(HxoError::CheckpointIo("locked".to_string()))
                    } else {
                        Ok(7)
                    }
                }
            },
            3,
            Duration::from_millis(1),
        )
        .await;
        assert_eq!(result.ok(), Some(7));
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_retry_returns_last_error() {
        let mut attempts = 0;
        let result = retry_with_backoff(
            "checkpoint",
            || {
                attempts += 1;
                async move { Err::<i32, _>(HxoError::CheckpointIo("disk gone".to_string())) }
            },
            3,
            Duration::from_millis(1),
        )
        .await;
        assert!(matches!(result, Err(HxoError::CheckpointIo(_))));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(1000);
        assert_eq!(exponential_backoff(1, base, cap), Duration::from_millis(100));
        assert_eq!(exponential_backoff(2, base, cap), Duration::from_millis(200));
        assert_eq!(exponential_backoff(3, base, cap), Duration::from_millis(400));
        assert_eq!(exponential_backoff(10, base, cap), cap);
    }
}
