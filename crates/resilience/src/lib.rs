//! Resilience primitives for protecting calls to fallible operations.
//!
//! This crate provides **generic, reusable** protection around one logical
//! operation at a time:
//! - **Circuit Breaker**: detects repeated failures and fails fast while the
//!   underlying operation is unhealthy, probing for recovery after a
//!   cool-down
//! - **Retry Policy**: configurable attempts with exponential backoff and
//!   jitter, synchronous or asynchronous, optionally guarded per attempt by
//!   a circuit breaker
//!
//! Every protected execution returns a definite `Result`; failures of the
//! wrapped operation never escape as unwound panics. The implementations
//! are:
//! - Generic over error types (`<E: std::error::Error>`)
//! - Lock-free on the circuit breaker call path (atomic compare-and-swap)
//! - Testable with a clock abstraction ([`MockClock`])

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod circuit_breaker;
pub mod clock;
pub mod presets;
pub mod retry;

// Re-export circuit breaker types
pub use circuit_breaker::{
    BreakerError, BreakerMetrics, BreakerResult, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerConfigBuilder, CircuitState, ConfigError, ConfigResult,
};
// Re-export clock types
pub use clock::{Clock, MockClock, SystemClock};
// Re-export retry types
pub use retry::{CancelToken, RetryCondition, RetryError, RetryPolicy, RetryPolicyBuilder};
