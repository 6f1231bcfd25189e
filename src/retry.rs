//! Bounded retry with exponential backoff

use crate::config::RetryPolicy;
use crate::error::Result;
use std::future::Future;

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// policy's retries are used up. The last error is surfaced.
pub async fn with_retry<F, Fut, T>(policy: RetryPolicy, operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt >= policy.max_retries => return Err(e),
            Err(e) => {
                attempt += 1;
                tracing::warn!(
                    operation,
                    attempt,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = with_retry(fast(3), "test", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(MemoryError::StoreUnavailable("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry(fast(2), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MemoryError::EmbeddingFailed("timeout".into()))
        })
        .await;

        assert!(matches!(result, Err(MemoryError::EmbeddingFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_return_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry(fast(5), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MemoryError::InvalidStatus("pending".into()))
        })
        .await;

        assert!(matches!(result, Err(MemoryError::InvalidStatus(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
