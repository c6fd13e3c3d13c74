//! Retry policy for remote chain fetches
//!
//! Bounded attempts with a fixed delay. Which errors are worth retrying is an
//! explicit table ([`RetryPolicy::action_for`]) rather than a per call-site
//! decision: throttling is retried, everything else is skipped so the next
//! poll cycle picks the unit of work up again.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::extractor::FetchError;

/// What the watcher does with a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Retry within the attempt budget, then skip the unit of work.
    RetryThenSkip,
    /// Skip the unit of work immediately.
    SkipNow,
    /// Stop the current scan (shutdown requested).
    Abort,
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one (minimum 1).
    pub attempts: u32,

    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Creates a policy with a single attempt.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Error class to action.
    pub fn action_for(error: &FetchError) -> RetryAction {
        match error {
            FetchError::Throttled(_) => RetryAction::RetryThenSkip,
            FetchError::Remote(_) | FetchError::Decode(_) => RetryAction::SkipNow,
            FetchError::Cancelled => RetryAction::Abort,
        }
    }

    /// Executes a fetch, retrying throttled failures.
    ///
    /// The inter-attempt delay is interrupted by `cancel`, in which case
    /// [`FetchError::Cancelled`] is returned. Non-retryable errors and the last
    /// throttled error are returned unchanged.
    ///
    /// # Example
    /// ```rust,ignore
    /// let policy = RetryPolicy::default();
    /// let block = policy
    ///     .execute(&cancel, || async { extractor.get_block(number).await })
    ///     .await?;
    /// ```
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.attempts.max(1);
        let mut attempts = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempts > 0 {
                        tracing::info!(
                            target: "watcher::retry",
                            "Operation succeeded after {} attempt(s)",
                            attempts + 1
                        );
                    }
                    return Ok(result);
                }
                Err(err) => {
                    attempts += 1;

                    if Self::action_for(&err) != RetryAction::RetryThenSkip {
                        return Err(err);
                    }

                    if attempts >= max_attempts {
                        tracing::warn!(
                            target: "watcher::retry",
                            "Operation still throttled after {} attempts: {}",
                            attempts,
                            err
                        );
                        return Err(err);
                    }

                    tracing::debug!(
                        target: "watcher::retry",
                        "Throttled (attempt {}/{}): {}. Retrying in {:?}...",
                        attempts,
                        max_attempts,
                        err,
                        self.delay
                    );

                    tokio::select! {
                        () = cancel.cancelled() => return Err(FetchError::Cancelled),
                        () = tokio::time::sleep(self.delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let policy = RetryPolicy::default();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = policy
            .execute(&CancellationToken::new(), || {
                let c = counter_clone.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, FetchError>(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_is_retried_until_success() {
        let policy = RetryPolicy::new(5, Duration::from_secs(5));
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let start = tokio::time::Instant::now();

        let result = policy
            .execute(&CancellationToken::new(), || {
                let c = counter_clone.clone();
                async move {
                    let count = c.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        return Err(FetchError::Throttled("429".to_string()));
                    }
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        // Two fixed delays.
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_budget_exhausted() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<(), FetchError> = policy
            .execute(&CancellationToken::new(), || {
                let c = counter_clone.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(FetchError::Throttled("slow down".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(FetchError::Throttled(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_skip_immediately() {
        let policy = RetryPolicy::default();
        let counter = Arc::new(AtomicU32::new(0));

        for error in [FetchError::Remote("boom".to_string()), FetchError::Decode("bad".to_string())] {
            let counter_clone = counter.clone();
            let error_clone = error.clone();
            let result: Result<(), FetchError> = policy
                .execute(&CancellationToken::new(), || {
                    let c = counter_clone.clone();
                    let e = error_clone.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err(e)
                    }
                })
                .await;
            assert_eq!(result.unwrap_err(), error);
        }

        // One attempt per error, no retries.
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_delay() {
        let policy = RetryPolicy::new(10, Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        let result: Result<(), FetchError> = policy
            .execute(&cancel, || async { Err(FetchError::Throttled("429".to_string())) })
            .await;

        assert_eq!(result.unwrap_err(), FetchError::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(3600));
    }

    #[test]
    fn test_action_table() {
        assert_eq!(
            RetryPolicy::action_for(&FetchError::Throttled(String::new())),
            RetryAction::RetryThenSkip
        );
        assert_eq!(RetryPolicy::action_for(&FetchError::Remote(String::new())), RetryAction::SkipNow);
        assert_eq!(RetryPolicy::action_for(&FetchError::Decode(String::new())), RetryAction::SkipNow);
        assert_eq!(RetryPolicy::action_for(&FetchError::Cancelled), RetryAction::Abort);
    }
}
