//! # Error Budget
//!
//! Counts consecutive failures per category and decides whether the caller should retry.
//! Backoff is linear: the n-th consecutive failure waits `retry_delay * n` before retrying.
//!
//! Categories are independent keys, so a burst of audio errors never eats into the budget of a
//! particular connection or pipeline stage.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Key under which failures are counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Frame ingestion and decoding
    Audio,
    /// One peer connection, by id
    Connection(String),
    /// One AI pipeline stage, by name
    Pipeline(String),
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Audio => write!(f, "audio"),
            ErrorCategory::Connection(id) => write!(f, "connection:{}", id),
            ErrorCategory::Pipeline(stage) => write!(f, "pipeline:{}", stage),
        }
    }
}

/// Outcome of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again; the backoff `delay` has already been slept
    Retry { attempt: u32, delay: Duration },
    /// The budget is exhausted
    GiveUp { attempts: u32 },
}

impl RetryDecision {
    pub fn should_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

/// Retry limits, adjustable at runtime.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    retry_delay: Duration,
}

#[derive(Debug)]
struct BudgetState {
    counts: HashMap<ErrorCategory, u32>,
    policy: RetryPolicy,
}

/// Per-category retry accounting shared by every connection.
#[derive(Debug)]
pub struct ErrorBudget {
    inner: Mutex<BudgetState>,
}

impl ErrorBudget {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            inner: Mutex::new(BudgetState {
                counts: HashMap::new(),
                policy: RetryPolicy {
                    max_retries,
                    retry_delay,
                },
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bump the category and decide against the current policy.
    fn count_failure(&self, category: &ErrorCategory) -> RetryDecision {
        let mut inner = self.lock();
        let policy = inner.policy;
        let count = inner.counts.entry(category.clone()).or_insert(0);
        *count = count.saturating_add(1);

        if *count <= policy.max_retries {
            RetryDecision::Retry {
                attempt: *count,
                delay: policy.retry_delay * *count,
            }
        } else {
            RetryDecision::GiveUp { attempts: *count }
        }
    }

    fn log_give_up(category: &ErrorCategory, attempts: u32, err: &(dyn std::error::Error + Send + Sync + '_)) {
        error!(
            category = %category,
            attempts,
            error = %err,
            "Error exceeded max retries, giving up"
        );
    }

    /// Count a failure and, if the budget allows, back off before telling the caller to retry.
    ///
    /// ## Backoff:
    /// The counter is bumped under the lock, the sleep happens after the lock is released, so
    /// one category backing off never delays another.
    pub async fn record_and_maybe_retry(
        &self,
        category: &ErrorCategory,
        err: &(dyn std::error::Error + Send + Sync + '_),
    ) -> RetryDecision {
        let decision = self.count_failure(category);
        match decision {
            RetryDecision::Retry { attempt, delay } => {
                warn!(
                    category = %category,
                    attempt,
                    max_retries = self.max_retries(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after error"
                );
                tokio::time::sleep(delay).await;
            }
            RetryDecision::GiveUp { attempts } => Self::log_give_up(category, attempts, err),
        }
        decision
    }

    /// Count a failure for work that is dropped rather than re-attempted. Never sleeps.
    ///
    /// A `Retry` decision here only means the category is still within budget; its `delay` is
    /// what a re-attempt would have waited.
    pub fn record_failure(
        &self,
        category: &ErrorCategory,
        err: &(dyn std::error::Error + Send + Sync + '_),
    ) -> RetryDecision {
        let decision = self.count_failure(category);
        match decision {
            RetryDecision::Retry { attempt, .. } => {
                debug!(category = %category, attempt, error = %err, "Failure counted, work dropped");
            }
            RetryDecision::GiveUp { attempts } => Self::log_give_up(category, attempts, err),
        }
        decision
    }

    /// A success clears the consecutive-failure count of its category.
    pub fn record_success(&self, category: &ErrorCategory) {
        if let Some(count) = self.lock().counts.get_mut(category) {
            *count = 0;
        }
    }

    /// Drop a category entirely, e.g. when its connection is gone.
    pub fn forget(&self, category: &ErrorCategory) {
        self.lock().counts.remove(category);
    }

    /// Current counts keyed by the category's display name.
    pub fn snapshot(&self) -> HashMap<String, u32> {
        self.lock()
            .counts
            .iter()
            .map(|(category, count)| (category.to_string(), *count))
            .collect()
    }

    pub fn max_retries(&self) -> u32 {
        self.lock().policy.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.lock().policy.retry_delay
    }

    /// Swap the retry policy. Counts already recorded are kept.
    pub fn reconfigure(&self, max_retries: u32, retry_delay: Duration) {
        let mut inner = self.lock();
        if inner.policy.max_retries != max_retries || inner.policy.retry_delay != retry_delay {
            info!(
                max_retries,
                retry_delay_ms = retry_delay.as_millis() as u64,
                "Retry policy updated"
            );
        }
        inner.policy = RetryPolicy {
            max_retries,
            retry_delay,
        };
    }

    /// Run `op` until it succeeds or the category's budget is exhausted.
    ///
    /// Each failure goes through [`ErrorBudget::record_and_maybe_retry`]; a success resets the
    /// category. The last error is returned when the budget gives up.
    pub async fn run_with_retry<T, E, F, Fut>(&self, category: &ErrorCategory, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync,
    {
        loop {
            match op().await {
                Ok(value) => {
                    self.record_success(category);
                    return Ok(value);
                }
                Err(err) => {
                    if !self.record_and_maybe_retry(category, &err).await.should_retry() {
                        return Err(err);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn count(budget: &ErrorBudget, category: &ErrorCategory) -> u32 {
        budget.snapshot().get(&category.to_string()).copied().unwrap_or(0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_retries_with_growing_backoff_then_give_up() {
        let budget = ErrorBudget::new(3, Duration::from_secs(1));
        let err = StreamError::audio("decode failed");
        let mut delays = Vec::new();

        for expected_attempt in 1..=3 {
            let start = Instant::now();
            let decision = budget.record_and_maybe_retry(&ErrorCategory::Audio, &err).await;
            match decision {
                RetryDecision::Retry { attempt, delay } => {
                    assert_eq!(attempt, expected_attempt);
                    assert_eq!(start.elapsed(), delay);
                    delays.push(delay);
                }
                RetryDecision::GiveUp { .. } => panic!("gave up too early"),
            }
        }
        assert!(delays.windows(2).all(|pair| pair[0] < pair[1]));

        let start = Instant::now();
        let decision = budget.record_and_maybe_retry(&ErrorCategory::Audio, &err).await;
        assert_eq!(decision, RetryDecision::GiveUp { attempts: 4 });
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_categories_do_not_share_budgets() {
        let budget = ErrorBudget::new(1, Duration::from_millis(10));
        let err = StreamError::audio("bad chunk");
        let conn = ErrorCategory::Connection("conn-1".to_string());

        assert!(budget.record_and_maybe_retry(&ErrorCategory::Audio, &err).await.should_retry());
        assert!(!budget.record_and_maybe_retry(&ErrorCategory::Audio, &err).await.should_retry());

        // the connection budget is untouched by the audio storm
        assert!(budget.record_and_maybe_retry(&conn, &err).await.should_retry());
        assert_eq!(count(&budget, &conn), 1);
        assert_eq!(count(&budget, &ErrorCategory::Audio), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_the_category() {
        let budget = ErrorBudget::new(2, Duration::from_millis(10));
        let err = StreamError::pipeline("stt stalled");
        let stage = ErrorCategory::Pipeline("feed".to_string());

        budget.record_and_maybe_retry(&stage, &err).await;
        budget.record_and_maybe_retry(&stage, &err).await;
        budget.record_success(&stage);
        assert_eq!(count(&budget, &stage), 0);

        match budget.record_and_maybe_retry(&stage, &err).await {
            RetryDecision::Retry { attempt, delay } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_millis(10));
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_and_forget() {
        let budget = ErrorBudget::new(3, Duration::ZERO);
        let err = StreamError::connection("send failed");
        let conn = ErrorCategory::Connection("abc".to_string());
        budget.record_and_maybe_retry(&conn, &err).await;

        let snapshot = budget.snapshot();
        assert_eq!(snapshot.get("connection:abc"), Some(&1));

        budget.forget(&conn);
        assert!(budget.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_retry_recovers_from_transient_failures() {
        let budget = ErrorBudget::new(3, Duration::from_millis(5));
        let calls = AtomicU32::new(0);
        let stage = ErrorCategory::Pipeline("tts".to_string());

        let result = budget
            .run_with_retry(&stage, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(StreamError::pipeline("transient"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(count(&budget, &stage), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_retry_gives_up_after_budget() {
        let budget = ErrorBudget::new(2, Duration::from_millis(5));
        let calls = AtomicU32::new(0);

        let result: Result<(), StreamError> = budget
            .run_with_retry(&ErrorCategory::Audio, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StreamError::audio("always broken")) }
            })
            .await;

        assert!(result.is_err());
        // one initial attempt plus two retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_failure_counts_without_sleeping() {
        let budget = ErrorBudget::new(2, Duration::from_secs(1));
        let err = StreamError::audio("empty chunk");
        let start = Instant::now();

        assert_eq!(
            budget.record_failure(&ErrorCategory::Audio, &err),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert!(budget.record_failure(&ErrorCategory::Audio, &err).should_retry());
        assert_eq!(
            budget.record_failure(&ErrorCategory::Audio, &err),
            RetryDecision::GiveUp { attempts: 3 }
        );
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_applies_to_the_next_failure() {
        let budget = ErrorBudget::new(3, Duration::from_secs(1));
        let err = StreamError::pipeline("feed rejected");
        let stage = ErrorCategory::Pipeline("feed".to_string());
        budget.record_and_maybe_retry(&stage, &err).await;

        budget.reconfigure(1, Duration::from_millis(50));
        assert_eq!(budget.max_retries(), 1);
        assert_eq!(budget.retry_delay(), Duration::from_millis(50));

        // the existing count of one is kept, so the second failure is already over budget
        assert_eq!(
            budget.record_and_maybe_retry(&stage, &err).await,
            RetryDecision::GiveUp { attempts: 2 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_futures_holding_the_error_are_send() {
        fn assert_send<T: Send>(_: T) {}
        let budget = ErrorBudget::new(1, Duration::from_millis(1));
        let err = StreamError::connection("send failed");
        assert_send(budget.record_and_maybe_retry(&ErrorCategory::Audio, &err));

        let handle = tokio::spawn(async move {
            let budget = ErrorBudget::new(1, Duration::from_millis(1));
            let err = StreamError::connection("send failed");
            budget.record_and_maybe_retry(&ErrorCategory::Audio, &err).await
        });
        assert!(handle.await.unwrap().should_retry());
    }
}
