//! Retry with exponential backoff
//!
//! Database calls retry only on transiently classified failures: deadlocks,
//! serialization failures, dropped connections, lock timeouts, and per-call
//! timeout expiry. Anything else aborts the pipeline on the first attempt.

use std::future::Future;
use std::time::Duration;

use fileloader_common::LoadError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(200),
            backoff_factor: 2,
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Run `operation` under the policy, sleeping between transient failures.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, LoadError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LoadError>>,
{
    let mut delay = policy.initial_delay;

    for attempt in 1..=policy.attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    attempts = policy.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * policy.backoff_factor).min(policy.max_delay);
            },
            Err(e) => return Err(e),
        }
    }

    unreachable!("retry loop returns on the final attempt")
}

/// Dialect-agnostic transient classification by message content, plus the
/// sqlx error shapes that always indicate a connectivity problem.
pub fn is_transient_db_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        other => {
            let message = other.to_string().to_lowercase();
            [
                "deadlock",
                "serialization failure",
                "could not serialize",
                "connection reset",
                "connection closed",
                "broken pipe",
                "lock timeout",
                "lock wait timeout",
                "database is locked",
                "timed out",
            ]
            .iter()
            .any(|needle| message.contains(needle))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> LoadError {
        LoadError::database("test op", "deadlock detected", true)
    }

    fn fatal() -> LoadError {
        LoadError::database("test op", "syntax error", false)
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(RetryPolicy::default(), "insert", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient())
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_configured_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(RetryPolicy::default(), "insert", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(RetryPolicy::default(), "insert", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(fatal()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn classifies_messages_dialect_agnostically() {
        let locked = sqlx::Error::Protocol("database is locked".to_string());
        assert!(is_transient_db_error(&locked));
        let deadlock = sqlx::Error::Protocol("Deadlock found when trying to get lock".to_string());
        assert!(is_transient_db_error(&deadlock));
        let syntax = sqlx::Error::Protocol("syntax error at or near SELCT".to_string());
        assert!(!is_transient_db_error(&syntax));
        assert!(is_transient_db_error(&sqlx::Error::PoolTimedOut));
    }
}
