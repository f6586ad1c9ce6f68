//! # Circuit Breaker
//!
//! Guards one downstream stage. After `failure_threshold` consecutive failures the breaker opens
//! and rejects calls without invoking the stage; once `recovery_timeout` has passed since the last
//! failure, a single trial call is let through to decide whether to close again.

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Why a guarded call did not produce a value.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// Rejected without calling the stage
    Open,
    /// The stage was called and failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open => write!(f, "Circuit breaker is open"),
            BreakerError::Inner(err) => write!(f, "{}", err),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BreakerError::Open => None,
            BreakerError::Inner(err) => Some(err),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<BreakerState>,
}

/// Clears the half-open trial slot if the guarded future is dropped before it finishes.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
                failure_threshold,
                recovery_timeout,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke `f` through the breaker.
    ///
    /// ## Behavior by state:
    /// - **CLOSED**: call through; failures count towards the threshold
    /// - **OPEN**: `Err(BreakerError::Open)` without calling, until the recovery timeout elapses
    /// - **HALF_OPEN**: exactly one trial call; concurrent callers are rejected as if open
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let trial = self.admit()?;
        let mut guard = TrialGuard { breaker: self, armed: trial };

        let result = f().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Decide whether a call may proceed. `Ok(true)` means it is the half-open trial.
    fn admit<E>(&self) -> Result<bool, BreakerError<E>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let recovery_timeout = inner.recovery_timeout;
                let recovered = inner
                    .last_failure
                    .map(|at| at.elapsed() >= recovery_timeout)
                    .unwrap_or(true);
                if !recovered {
                    return Err(BreakerError::Open);
                }
                info!(breaker = %self.name, "Circuit breaker half-open, allowing a trial call");
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                Ok(true)
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(BreakerError::Open)
                } else {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "Circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.trial_in_flight = false;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                warn!(breaker = %self.name, "Trial failed, circuit breaker reopened");
            }
            CircuitState::Closed if inner.failure_count >= inner.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "Circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    /// Force the breaker open, e.g. when a stage has exhausted its retry budget.
    pub fn trip(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Open;
        inner.failure_count = inner.failure_count.max(inner.failure_threshold);
        inner.last_failure = Some(Instant::now());
        inner.trial_in_flight = false;
        warn!(breaker = %self.name, "Circuit breaker tripped");
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: inner.failure_threshold,
            recovery_timeout_seconds: inner.recovery_timeout.as_secs(),
        }
    }

    /// Change the threshold and recovery timeout without touching the current state.
    ///
    /// An open breaker measures the new timeout from its last failure.
    pub fn reconfigure(&self, failure_threshold: u32, recovery_timeout: Duration) {
        let mut inner = self.lock();
        if inner.failure_threshold != failure_threshold || inner.recovery_timeout != recovery_timeout {
            info!(
                breaker = %self.name,
                failure_threshold,
                recovery_timeout_secs = recovery_timeout.as_secs(),
                "Circuit breaker reconfigured"
            );
        }
        inner.failure_threshold = failure_threshold;
        inner.recovery_timeout = recovery_timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.call(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, BreakerError<&'static str>> {
        breaker.call(|| async { Ok(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_stops_calling() {
        let breaker = CircuitBreaker::new("ai_pipeline", 5, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner("boom"))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result: Result<(), BreakerError<&str>> = breaker
            .call(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_after_recovery_timeout_closes_on_success() {
        let breaker = CircuitBreaker::new("tts", 2, Duration::from_secs(60));
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_with_fresh_timer() {
        let breaker = CircuitBreaker::new("stt", 1, Duration::from_secs(10));
        fail(&breaker).await.ok();
        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner(_))));
        assert_eq!(breaker.state(), CircuitState::Open);

        // the timer restarted at the trial failure
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open)));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_trial_at_a_time() {
        let breaker = std::sync::Arc::new(CircuitBreaker::new("trial", 1, Duration::from_secs(1)));
        fail(&breaker).await.ok();
        tokio::time::advance(Duration::from_secs(1)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slow_trial = {
            let breaker = std::sync::Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        release_rx.await.ok();
                        Ok::<_, &'static str>(1)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open)));

        release_tx.send(()).unwrap();
        assert_eq!(slow_trial.await.unwrap().unwrap(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_in_closed_clears_failures() {
        let breaker = CircuitBreaker::new("pipeline", 3, Duration::from_secs(60));
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        succeed(&breaker).await.unwrap();
        fail(&breaker).await.ok();
        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trip_forces_open() {
        let breaker = CircuitBreaker::new("ai_pipeline", 5, Duration::from_secs(60));
        breaker.trip();
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.failure_count, 5);
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open)));
        assert_eq!(serde_json::to_value(snapshot.state).unwrap(), "OPEN");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_changes_threshold_and_recovery() {
        let breaker = CircuitBreaker::new("ai_pipeline", 5, Duration::from_secs(60));
        fail(&breaker).await.ok();

        breaker.reconfigure(2, Duration::from_secs(5));
        fail(&breaker).await.ok();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(succeed(&breaker).await.is_ok());

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.failure_threshold, 2);
        assert_eq!(snapshot.recovery_timeout_seconds, 5);
    }
}
