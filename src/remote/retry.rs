//! Transport-level retry with capped exponential backoff.

use std::future::Future;
use std::time::Duration;

use super::{RemoteError, RemoteResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based): base * 2^attempt, capped
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// the retries are used up
    pub async fn run<T, F, Fut>(&self, label: &str, retryable: impl Fn(&RemoteError) -> bool, mut op: F) -> RemoteResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if attempt < self.retries && retryable(&e) => {
                    let delay = self.delay(attempt);
                    tracing::debug!(label, attempt, ?delay, error = %e, "retrying remote call");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn instant(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        };
        assert_eq!(policy.delay(0).as_millis(), 1000);
        assert_eq!(policy.delay(2).as_millis(), 4000);
        assert_eq!(policy.delay(10).as_millis(), 30_000);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: RemoteResult<()> = instant(2)
            .run("list", |_| true, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::unavailable("down"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_at_once() {
        let calls = AtomicU32::new(0);
        let result: RemoteResult<()> = instant(5)
            .run("list", |e| !e.is_not_found(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::not_found("gone"))
            })
            .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = instant(3)
            .run("insert", RemoteError::is_unavailable, || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RemoteError::unavailable("blip"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
    }
}
