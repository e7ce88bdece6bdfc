//! Retry orchestration with exponential backoff and jitter
//!
//! A [`RetryPolicy`] is immutable configuration: it carries no state between
//! calls, so one policy can be shared by any number of concurrent callers.
//! Each execution owns its local attempt counter and last-error slot, invokes
//! the caller-supplied operation until success, exhaustion, or a
//! non-retryable error, and always returns a definite `Result`.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::circuit_breaker::{BreakerError, CircuitBreaker, ConfigError, ConfigResult};
use crate::clock::Clock;

/// Default maximum number of attempts
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default first-attempt backoff delay
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Default delay cap
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default exponential growth factor between attempts
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default jitter factor (0.0 = deterministic, 1.0 = full spread)
pub const DEFAULT_JITTER_FACTOR: f64 = 0.3;

/// Cap on the backoff exponent to keep the f64 math well-behaved
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Errors that terminate a retry sequence
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Attempts ran out, or the retry condition rejected the error.
    /// Wraps the last observed error and the number of attempts made.
    #[error("all retry attempts exhausted after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    /// The synchronous backoff wait was cancelled before the next attempt.
    #[error("retry cancelled while backing off after {attempts} attempts")]
    Interrupted { attempts: u32 },
}

/// Type alias for the type-erased retry predicate
type ErrorPredicate = Arc<dyn Fn(&dyn std::error::Error) -> bool + Send + Sync>;

/// Condition deciding whether an error is worth another attempt
pub enum RetryCondition {
    /// Retry all errors
    Always,
    /// Retry only errors accepted by the predicate
    Custom(ErrorPredicate),
}

impl RetryCondition {
    fn allows(&self, error: &dyn std::error::Error) -> bool {
        match self {
            RetryCondition::Always => true,
            RetryCondition::Custom(predicate) => predicate(error),
        }
    }
}

impl Clone for RetryCondition {
    fn clone(&self) -> Self {
        match self {
            Self::Always => Self::Always,
            Self::Custom(f) => Self::Custom(Arc::clone(f)),
        }
    }
}

impl std::fmt::Debug for RetryCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::Custom(_) => write!(f, "Custom(<function>)"),
        }
    }
}

impl Default for RetryCondition {
    fn default() -> Self {
        Self::Always
    }
}

/// Handle for interrupting a synchronous backoff wait.
///
/// Clones share the same flag. Cancelling wakes any thread currently parked
/// in [`RetryPolicy::execute_sync_cancellable`]'s backoff wait, which then
/// terminates its retry loop with [`RetryError::Interrupted`].
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token, waking any waiting retry loop.
    pub fn cancel(&self) {
        *self.inner.cancelled.lock() = true;
        self.inner.signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Park the calling thread for `timeout` or until cancelled.
    /// Returns true if the token was cancelled.
    fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self.inner.signal.wait_until(&mut cancelled, deadline).timed_out() {
                return *cancelled;
            }
        }
        true
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken").field("cancelled", &self.is_cancelled()).finish()
    }
}

/// Immutable retry configuration.
///
/// Delays follow `initial_delay * backoff_multiplier^(attempt - 1)`, capped
/// at `max_delay` and spread by a symmetric jitter factor.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    name: String,
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter_factor: f64,
    retry_on: RetryCondition,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            retry_on: RetryCondition::default(),
        }
    }
}

/// Builder for [`RetryPolicy`] with build-time validation
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.policy.name = name.into();
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.policy.backoff_multiplier = multiplier;
        self
    }

    /// Set the jitter factor, clamped to `[0, 1]`
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.policy.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Retry only errors accepted by the predicate
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&dyn std::error::Error) -> bool + Send + Sync + 'static,
    {
        self.policy.retry_on = RetryCondition::Custom(Arc::new(predicate));
        self
    }

    pub fn build(self) -> ConfigResult<RetryPolicy> {
        let policy = self.policy;

        if policy.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                message: "max_attempts must be greater than 0".to_string(),
            });
        }
        if policy.backoff_multiplier.is_nan() || policy.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                message: "backoff_multiplier must be at least 1.0".to_string(),
            });
        }
        if policy.jitter_factor.is_nan()
            || policy.jitter_factor < 0.0
            || policy.jitter_factor > 1.0
        {
            return Err(ConfigError::Invalid {
                message: "jitter_factor must be within [0, 1]".to_string(),
            });
        }
        if policy.initial_delay > policy.max_delay {
            return Err(ConfigError::Invalid {
                message: format!(
                    "initial_delay ({:?}) cannot be greater than max_delay ({:?})",
                    policy.initial_delay, policy.max_delay
                ),
            });
        }

        Ok(policy)
    }
}

impl RetryPolicy {
    /// Create a policy builder
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Name of the policy, for logging correlation
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of attempts per execution
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Compute the backoff delay after the given attempt (1-based).
    ///
    /// With a zero jitter factor the result is exactly the capped
    /// exponential delay; otherwise it is spread symmetrically around it and
    /// always lies within `[0, max_delay * (1 + jitter_factor)]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        if self.jitter_factor == 0.0 {
            return capped;
        }

        let mut rng = rand::thread_rng();
        let sample = 1.0 + rng.gen_range(-1.0..=1.0) * self.jitter_factor;
        Duration::from_secs_f64((capped.as_secs_f64() * sample).max(0.0))
    }

    fn capped_delay(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }

    fn give_up<E>(&self, attempt: u32, error: &E) -> bool
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        attempt >= self.max_attempts || !self.retry_on.allows(error)
    }

    /// Execute an async operation with retry.
    ///
    /// Between-attempt waits are timer-scheduled; no thread blocks while
    /// waiting to retry. Dropping the returned future cancels the sequence.
    #[instrument(skip(self, operation), fields(policy = %self.name, max_attempts = self.max_attempts))]
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut attempt = 1u32;
        loop {
            debug!(policy = %self.name, attempt, "executing operation");
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(policy = %self.name, attempts = attempt, "operation recovered");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if self.give_up(attempt, &error) {
                        warn!(
                            policy = %self.name,
                            attempts = attempt,
                            error = %error,
                            "retries stopped"
                        );
                        return Err(RetryError::Exhausted { attempts: attempt, source: error });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        policy = %self.name,
                        attempt,
                        delay = ?delay,
                        error = %error,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Execute an async operation that yields no value.
    pub async fn execute_void<F, Fut, E>(&self, operation: F) -> Result<(), RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.execute(operation).await
    }

    /// Execute a synchronous operation with retry.
    ///
    /// WARNING: the backoff wait blocks the calling thread with
    /// `std::thread::sleep`. Do not call this from within an async runtime.
    pub fn execute_sync<F, T, E>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.run_sync(operation, None)
    }

    /// Execute a synchronous operation that yields no value.
    pub fn execute_sync_void<F, E>(&self, operation: F) -> Result<(), RetryError<E>>
    where
        F: FnMut() -> Result<(), E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.run_sync(operation, None)
    }

    /// Execute a synchronous operation with retry and a cancellable backoff.
    ///
    /// Cancelling the token while the loop is parked between attempts
    /// terminates the sequence with [`RetryError::Interrupted`] instead of
    /// silently resuming. An in-flight operation is never aborted.
    pub fn execute_sync_cancellable<F, T, E>(
        &self,
        operation: F,
        cancel: &CancelToken,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.run_sync(operation, Some(cancel))
    }

    fn run_sync<F, T, E>(
        &self,
        mut operation: F,
        cancel: Option<&CancelToken>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut attempt = 1u32;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if self.give_up(attempt, &error) {
                        warn!(
                            policy = %self.name,
                            attempts = attempt,
                            error = %error,
                            "retries stopped"
                        );
                        return Err(RetryError::Exhausted { attempts: attempt, source: error });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        policy = %self.name,
                        attempt,
                        delay = ?delay,
                        error = %error,
                        "attempt failed, backing off"
                    );
                    match cancel {
                        Some(token) => {
                            if token.wait_for(delay) {
                                warn!(
                                    policy = %self.name,
                                    attempts = attempt,
                                    "backoff wait cancelled"
                                );
                                return Err(RetryError::Interrupted { attempts: attempt });
                            }
                        }
                        None => std::thread::sleep(delay),
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Execute an async operation with each attempt guarded by a circuit
    /// breaker.
    ///
    /// A breaker rejection ([`BreakerError::Open`]) counts as a failed
    /// attempt and remains subject to the retry condition and backoff, so an
    /// open circuit is re-probed across attempts rather than short-circuiting
    /// the whole sequence. A retry span that outlives the breaker's wait
    /// duration can therefore observe recovery.
    #[instrument(skip(self, breaker, operation), fields(policy = %self.name, breaker = %breaker.name()))]
    pub async fn execute_with_breaker<C, F, Fut, T, E>(
        &self,
        breaker: &CircuitBreaker<C>,
        mut operation: F,
    ) -> Result<T, RetryError<BreakerError<E>>>
    where
        C: Clock,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut attempt = 1u32;
        loop {
            match breaker.execute(&mut operation).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if self.give_up(attempt, &error) {
                        warn!(
                            policy = %self.name,
                            attempts = attempt,
                            error = %error,
                            "guarded retries stopped"
                        );
                        return Err(RetryError::Exhausted { attempts: attempt, source: error });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        policy = %self.name,
                        attempt,
                        delay = ?delay,
                        error = %error,
                        "guarded attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Synchronous variant of [`execute_with_breaker`](Self::execute_with_breaker).
    pub fn execute_with_breaker_sync<C, F, T, E>(
        &self,
        breaker: &CircuitBreaker<C>,
        mut operation: F,
    ) -> Result<T, RetryError<BreakerError<E>>>
    where
        C: Clock,
        F: FnMut() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut attempt = 1u32;
        loop {
            match breaker.call(&mut operation) {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if self.give_up(attempt, &error) {
                        return Err(RetryError::Exhausted { attempts: attempt, source: error });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        policy = %self.name,
                        attempt,
                        delay = ?delay,
                        error = %error,
                        "guarded attempt failed, backing off"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}
