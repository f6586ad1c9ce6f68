//! # Resilience
//!
//! Failure handling shared by every connection:
//! - **Budget**: per-category retry counting with linear backoff
//! - **Breaker**: stops calling a stage that keeps failing
//! - **Degradation**: service health flags and the fallback apology

pub mod breaker;
pub mod budget;
pub mod degradation;

pub use breaker::{BreakerError, CircuitBreaker, CircuitState};
pub use budget::{ErrorBudget, ErrorCategory, RetryDecision};
pub use degradation::{GracefulDegradation, Service};
