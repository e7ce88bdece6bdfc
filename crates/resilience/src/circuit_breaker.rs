//! Circuit breaker for failing fast around an unreliable operation
//!
//! The breaker tracks recent failures and successes for one named operation
//! and decides, at the start of every call, whether to admit it, probe for
//! recovery, or reject it immediately. All state lives in per-instance
//! atomics driven by compare-and-swap, so concurrent callers never serialize
//! on a lock to learn that the circuit is open.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};

/// Simple configuration error for validation
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Configuration result type using simple config errors
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors produced by a protected call.
///
/// Generic over the underlying operation error type `E` so the original
/// failure is preserved as the `source` of the resilience-level error.
#[derive(Debug, Error)]
pub enum BreakerError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Call rejected because the circuit is open or all half-open probe
    /// slots for the current episode are taken.
    #[error("circuit breaker is open, rejecting call")]
    Open,

    /// The operation completed but took longer than the per-call budget.
    /// Detected after the fact; the operation itself is never aborted.
    #[error("operation exceeded call timeout of {limit:?} (took {elapsed:?})")]
    Timeout { elapsed: Duration, limit: Duration },

    /// The underlying operation failed.
    #[error("operation failed")]
    Operation {
        #[source]
        source: E,
    },
}

/// Result type for breaker-protected operations
pub type BreakerResult<T, E> = Result<T, BreakerError<E>>;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed = 0,
    /// Circuit is open, rejecting requests
    Open = 1,
    /// Circuit is half-open, allowing limited probe requests
    HalfOpen = 2,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Name used for logging and metrics correlation, not for logic
    pub name: String,
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Number of consecutive half-open successes needed to close the circuit.
    /// Also the number of probe calls admitted per half-open episode.
    pub success_threshold: u32,
    /// Time to wait in the open state before probing for recovery
    pub wait_duration: Duration,
    /// Per-call wall-clock budget; slower calls count as failures
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            success_threshold: 2,
            wait_duration: Duration::from_secs(60),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                message: "failure_threshold must be greater than 0".to_string(),
            });
        }

        if self.success_threshold == 0 {
            return Err(ConfigError::Invalid {
                message: "success_threshold must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn wait_duration(mut self, wait: Duration) -> Self {
        self.config.wait_duration = wait;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Circuit breaker metrics snapshot for monitoring
#[derive(Debug, Clone)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_calls: u32,
    pub total_calls: u64,
    pub last_failure_time: Option<Instant>,
}

impl fmt::Display for BreakerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CircuitBreaker[state={}, failures={}, successes={}",
            self.state, self.failure_count, self.success_count
        )?;
        if let Some(last_failure) = self.last_failure_time {
            write!(f, ", last_failure={:?} ago", last_failure.elapsed())?;
        }
        if self.state == CircuitState::HalfOpen {
            write!(f, ", half_open_calls={}", self.half_open_calls)?;
        }
        write!(f, "]")
    }
}

// The state machine lives in one packed atomic word so a transition and the
// episode counters it resets are installed in a single compare-exchange:
// bits 0..8 hold the state tag, bits 8..36 the calls admitted in the current
// half-open episode, bits 36..64 the consecutive half-open successes.
const FIELD_BITS: u32 = 28;
const FIELD_MASK: u64 = (1 << FIELD_BITS) - 1;

const fn pack(state: CircuitState, admitted: u32, successes: u32) -> u64 {
    (state as u64)
        | ((admitted as u64 & FIELD_MASK) << 8)
        | ((successes as u64 & FIELD_MASK) << (8 + FIELD_BITS))
}

fn state_of(cell: u64) -> CircuitState {
    match cell & 0xff {
        0 => CircuitState::Closed,
        1 => CircuitState::Open,
        _ => CircuitState::HalfOpen,
    }
}

fn admitted_of(cell: u64) -> u32 {
    ((cell >> 8) & FIELD_MASK) as u32
}

fn successes_of(cell: u64) -> u32 {
    ((cell >> (8 + FIELD_BITS)) & FIELD_MASK) as u32
}

/// Sentinel for "no failure recorded yet" in the last-failure cell.
const NO_FAILURE: u64 = u64::MAX;

/// Circuit breaker protecting one logical operation.
///
/// A breaker is created once per protected operation and lives for the
/// process lifetime (or until explicitly [`reset`](Self::reset)). Share it
/// between callers with `Arc`; every method takes `&self`.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    cell: AtomicU64,
    failure_count: AtomicU32,
    total_calls: AtomicU64,
    last_failure_nanos: AtomicU64,
    started: Instant,
    clock: C,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = self.cell.load(Ordering::Acquire);
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &state_of(cell))
            .field("failure_count", &self.failure_count.load(Ordering::Acquire))
            .field("success_count", &successes_of(cell))
            .finish()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker with the given configuration using the
    /// system clock
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Create a circuit breaker with default configuration (convenience method)
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default()).expect("Default config should be valid")
    }
}

impl Default for CircuitBreaker<SystemClock> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock (useful for testing)
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;

        let started = clock.now();
        Ok(Self {
            config,
            cell: AtomicU64::new(pack(CircuitState::Closed, 0, 0)),
            failure_count: AtomicU32::new(0),
            total_calls: AtomicU64::new(0),
            last_failure_nanos: AtomicU64::new(NO_FAILURE),
            started,
            clock,
        })
    }

    /// Execute an async operation with circuit breaker protection.
    ///
    /// Checks admission, runs the operation if admitted, and records the
    /// result to update the circuit state. A slow success (wall-clock time
    /// over `call_timeout`) is recorded as a failure and surfaces as
    /// [`BreakerError::Timeout`].
    #[instrument(skip(self, operation), fields(breaker = %self.config.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if !self.try_acquire() {
            debug!(breaker = %self.config.name, "rejecting call, circuit is {}", self.state());
            return Err(BreakerError::Open);
        }

        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let start = self.clock.now();
        let result = operation().await;
        let elapsed = self.clock.now().saturating_duration_since(start);

        self.settle(result, elapsed)
    }

    /// Execute an async operation that yields no value.
    pub async fn execute_void<F, Fut, E>(&self, operation: F) -> BreakerResult<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.execute(operation).await
    }

    /// Execute a synchronous operation with circuit breaker protection.
    ///
    /// Synchronous alternative to [`execute`](Self::execute) for non-async
    /// contexts.
    #[instrument(skip(self, operation), fields(breaker = %self.config.name))]
    pub fn call<F, T, E>(&self, operation: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        if !self.try_acquire() {
            debug!(breaker = %self.config.name, "rejecting call, circuit is {}", self.state());
            return Err(BreakerError::Open);
        }

        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let start = self.clock.now();
        let result = operation();
        let elapsed = self.clock.now().saturating_duration_since(start);

        self.settle(result, elapsed)
    }

    /// Execute a synchronous operation that yields no value.
    pub fn call_void<F, E>(&self, operation: F) -> BreakerResult<(), E>
    where
        F: FnOnce() -> Result<(), E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.call(operation)
    }

    /// Record the outcome of an admitted call and map it to the public error
    /// taxonomy. The single point where operation errors enter the breaker.
    fn settle<T, E>(&self, result: Result<T, E>, elapsed: Duration) -> BreakerResult<T, E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match result {
            Ok(_) if elapsed > self.config.call_timeout => {
                self.record_failure();
                warn!(
                    breaker = %self.config.name,
                    elapsed = ?elapsed,
                    limit = ?self.config.call_timeout,
                    "operation completed but exceeded call timeout"
                );
                Err(BreakerError::Timeout { elapsed, limit: self.config.call_timeout })
            }
            Ok(value) => {
                self.record_success();
                debug!(breaker = %self.config.name, "operation succeeded");
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                warn!(breaker = %self.config.name, error = %error, "operation failed");
                Err(BreakerError::Operation { source: error })
            }
        }
    }

    /// Decide admission for one call, atomically.
    ///
    /// Closed circuits always admit. Open circuits admit one caller as the
    /// first probe once the wait duration has elapsed; the winning
    /// compare-exchange installs the half-open state with fresh episode
    /// counters. Half-open circuits hand out at most `success_threshold`
    /// probe slots per episode.
    fn try_acquire(&self) -> bool {
        loop {
            let cell = self.cell.load(Ordering::Acquire);
            match state_of(cell) {
                CircuitState::Closed => return true,
                CircuitState::Open => {
                    if !self.wait_elapsed() {
                        return false;
                    }
                    let next = pack(CircuitState::HalfOpen, 1, 0);
                    if self
                        .cell
                        .compare_exchange(cell, next, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        info!(
                            breaker = %self.config.name,
                            "wait duration elapsed, transitioning to HALF_OPEN"
                        );
                        return true;
                    }
                    // Lost the transition race; re-evaluate the new state.
                }
                CircuitState::HalfOpen => {
                    let admitted = admitted_of(cell);
                    if admitted >= self.config.success_threshold {
                        return false;
                    }
                    let next = pack(CircuitState::HalfOpen, admitted + 1, successes_of(cell));
                    if self
                        .cell
                        .compare_exchange(cell, next, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                }
            }
        }
    }

    fn wait_elapsed(&self) -> bool {
        match self.last_failure_nanos.load(Ordering::Acquire) {
            NO_FAILURE => true,
            nanos => {
                let wait = self.config.wait_duration.as_nanos() as u64;
                self.elapsed_nanos().saturating_sub(nanos) >= wait
            }
        }
    }

    fn elapsed_nanos(&self) -> u64 {
        self.clock.now().saturating_duration_since(self.started).as_nanos() as u64
    }

    fn record_success(&self) {
        loop {
            let cell = self.cell.load(Ordering::Acquire);
            match state_of(cell) {
                CircuitState::Closed => {
                    // Consecutive-failure tracking restarts on any success.
                    self.failure_count.store(0, Ordering::Release);
                    return;
                }
                CircuitState::HalfOpen => {
                    let successes = successes_of(cell) + 1;
                    if successes >= self.config.success_threshold {
                        let next = pack(CircuitState::Closed, 0, 0);
                        if self
                            .cell
                            .compare_exchange(cell, next, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            self.failure_count.store(0, Ordering::Release);
                            info!(
                                breaker = %self.config.name,
                                "circuit breaker closed after {successes} successes"
                            );
                            return;
                        }
                    } else {
                        let next = pack(CircuitState::HalfOpen, admitted_of(cell), successes);
                        if self
                            .cell
                            .compare_exchange(cell, next, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            return;
                        }
                    }
                    // Lost a race with another probe; re-read and retry.
                }
                CircuitState::Open => {
                    // A probe admitted earlier in the episode finished after
                    // another probe already reopened the circuit.
                    warn!(breaker = %self.config.name, "success observed while circuit is open");
                    return;
                }
            }
        }
    }

    fn record_failure(&self) {
        self.last_failure_nanos.store(self.elapsed_nanos(), Ordering::Release);

        loop {
            let cell = self.cell.load(Ordering::Acquire);
            match state_of(cell) {
                CircuitState::Closed => {
                    let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                    if failures >= self.config.failure_threshold {
                        let next = pack(CircuitState::Open, 0, 0);
                        if self
                            .cell
                            .compare_exchange(cell, next, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            warn!(
                                breaker = %self.config.name,
                                "circuit breaker opened after {failures} failures"
                            );
                        }
                        // A failed exchange means another caller already
                        // transitioned; the failure is recorded either way.
                    }
                    return;
                }
                CircuitState::HalfOpen => {
                    // One failure undoes the whole recovery episode.
                    let next = pack(CircuitState::Open, 0, 0);
                    if self
                        .cell
                        .compare_exchange(cell, next, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        warn!(
                            breaker = %self.config.name,
                            "circuit breaker reopened after failure in HALF_OPEN"
                        );
                        return;
                    }
                }
                CircuitState::Open => return,
            }
        }
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        state_of(self.cell.load(Ordering::Acquire))
    }

    /// Get a metrics snapshot of the breaker
    pub fn metrics(&self) -> BreakerMetrics {
        let cell = self.cell.load(Ordering::Acquire);
        BreakerMetrics {
            state: state_of(cell),
            failure_count: self.failure_count.load(Ordering::Acquire),
            success_count: successes_of(cell),
            half_open_calls: admitted_of(cell),
            total_calls: self.total_calls.load(Ordering::Acquire),
            last_failure_time: match self.last_failure_nanos.load(Ordering::Acquire) {
                NO_FAILURE => None,
                nanos => Some(self.started + Duration::from_nanos(nanos)),
            },
        }
    }

    /// Name of the protected operation
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Reset the circuit breaker to the closed state with zeroed counters.
    ///
    /// Operator intervention, not part of normal state transitions.
    pub fn reset(&self) {
        self.cell.store(pack(CircuitState::Closed, 0, 0), Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.last_failure_nanos.store(NO_FAILURE, Ordering::Release);
        info!(breaker = %self.config.name, "circuit breaker manually reset to CLOSED");
    }
}
