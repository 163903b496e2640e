//! Bounded retry for buffered upstream calls.
//!
//! A failed attempt is retried immediately, without backoff, and only when
//! the error is a transport failure. Streaming calls never go through here:
//! once bytes reach the client a second upstream request cannot be merged
//! into the same response.

use std::future::Future;

use tracing::{debug, warn};

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

impl RetryPolicy {
    /// A single attempt.
    pub fn none() -> Self {
        Self { max_attempts: 1 }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempts are used up.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, ProxyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProxyError>>,
{
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt, "upstream call succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) if attempt >= policy.max_attempts => {
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "upstream call failed, no attempts left"
                );
                return Err(err);
            }
            Err(err) => {
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "upstream call failed, retrying"
                );
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_default_policy() {
        assert_eq!(RetryPolicy::default().max_attempts, 2);
        assert_eq!(RetryPolicy::none().max_attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let result = with_retry(&RetryPolicy::default(), || async { Ok::<_, ProxyError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_one_transient_failure_is_retried() {
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = call_count.clone();

        let result = with_retry(&RetryPolicy::default(), move || {
            let count = call_count_clone.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if count < 2 {
                    Err(ProxyError::UpstreamTransport("connection reset".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_third_attempt() {
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = call_count.clone();

        let result = with_retry(&RetryPolicy::default(), move || {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
            async move { Err::<i32, _>(ProxyError::UpstreamTransport("refused".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(ProxyError::UpstreamTransport(_))));
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = call_count.clone();

        let result = with_retry(&RetryPolicy::default(), move || {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                Err::<i32, _>(ProxyError::UpstreamStatus {
                    status: 529,
                    message: "overloaded".to_string(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_none_policy_never_retries() {
        let call_count = Arc::new(AtomicU32::new(0));
        let call_count_clone = call_count.clone();

        let _ = with_retry(&RetryPolicy::none(), move || {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
            async move { Err::<i32, _>(ProxyError::UpstreamTransport("reset".to_string())) }
        })
        .await;

        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }
}
