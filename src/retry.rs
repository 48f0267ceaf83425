//! Deadline + exponential backoff around a single external call

use crate::config::RetryPolicy;
use crate::error::OrchestrationError;
use crate::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Run `call` under `deadline`, retrying retryable failures.
///
/// A call that exceeds the deadline counts as an upstream failure. At most
/// `policy.max_retries` extra attempts are made.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Duration,
    operation: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;

    loop {
        let outcome = match tokio::time::timeout(deadline, call()).await {
            Ok(result) => result,
            Err(_) => Err(OrchestrationError::UpstreamError(format!(
                "{} timed out after {:?}",
                operation, deadline
            ))),
        };

        match outcome {
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let backoff = policy.backoff_for(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying external call"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            llm_parse_retries: 1,
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retry(&policy(2), Duration::from_secs(1), "search", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(OrchestrationError::UpstreamError("503".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry(&policy(2), Duration::from_secs(1), "search", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(OrchestrationError::UpstreamError("503".into()))
        })
        .await;

        assert!(matches!(result, Err(OrchestrationError::UpstreamError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_auth() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry(&policy(3), Duration::from_secs(1), "search", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(OrchestrationError::AuthError("401".into()))
        })
        .await;

        assert!(matches!(result, Err(OrchestrationError::AuthError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_parse_errors_are_left_to_the_caller() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = tokio_test::block_on(with_retry(
            &policy(3),
            Duration::from_secs(1),
            "plan",
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(OrchestrationError::LlmParseError("not json".into()))
            },
        ));

        tokio_test::assert_err!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let ok = tokio_test::block_on(with_retry(&policy(0), Duration::from_secs(1), "plan", || async { Ok(1) }));
        assert_eq!(tokio_test::assert_ok!(ok), 1);
    }

    #[tokio::test]
    async fn test_timeout_becomes_upstream_error() {
        let result: Result<()> = with_retry(&policy(0), Duration::from_millis(10), "explore", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, OrchestrationError::UpstreamError(_)));
        assert!(err.to_string().contains("explore timed out"));
    }
}
