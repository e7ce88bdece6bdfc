//! Pre-built retry profiles for common scenarios
//!
//! These are data, not logic: named, immutable [`RetryPolicy`] values tuned
//! for a class of operation. Use them as-is or as a starting point for a
//! custom builder chain.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Quick profile: few attempts, short delays.
///
/// Suited to interactive paths where failing fast beats eventual success.
pub fn quick() -> RetryPolicy {
    RetryPolicy::builder()
        .name("quick")
        .max_attempts(3)
        .initial_delay(Duration::from_millis(50))
        .max_delay(Duration::from_secs(1))
        .backoff_multiplier(2.0)
        .jitter_factor(0.1)
        .build()
        .expect("quick preset should be valid")
}

/// Resilient profile: more attempts with a long delay cap.
///
/// Suited to background work that should survive extended outages.
pub fn resilient() -> RetryPolicy {
    RetryPolicy::builder()
        .name("resilient")
        .max_attempts(8)
        .initial_delay(Duration::from_millis(200))
        .max_delay(Duration::from_secs(60))
        .backoff_multiplier(2.0)
        .jitter_factor(0.3)
        .build()
        .expect("resilient preset should be valid")
}

/// Network profile: longer waits and a condition restricted to
/// transport-level errors.
pub fn network() -> RetryPolicy {
    RetryPolicy::builder()
        .name("network")
        .max_attempts(5)
        .initial_delay(Duration::from_millis(500))
        .max_delay(Duration::from_secs(30))
        .backoff_multiplier(2.0)
        .jitter_factor(0.3)
        .retry_if(is_transport_error)
        .build()
        .expect("network preset should be valid")
}

/// Check the error text for common transport-level failure patterns.
fn is_transport_error(err: &dyn std::error::Error) -> bool {
    let err_str = err.to_string().to_lowercase();
    err_str.contains("connection")
        || err_str.contains("timeout")
        || err_str.contains("timed out")
        || err_str.contains("network")
        || err_str.contains("dns")
        || err_str.contains("refused")
        || err_str.contains("reset")
        || err_str.contains("broken pipe")
        || err_str.contains("unreachable")
}
