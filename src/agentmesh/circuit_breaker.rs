//! Circuit breaker for failing downstreams.
//!
//! A three-state machine guarding calls to a backend that may be unhealthy:
//!
//! ```text
//!            failures cross budget            timeout elapses
//!   Closed ───────────────────────▶ Open ───────────────────▶ HalfOpen
//!     ▲                              ▲                            │
//!     │      success streak          │        any failure         │
//!     └──────────────────────────────┴────────────────────────────┘
//! ```
//!
//! Closed admits every call and records the outcome. The breaker opens when
//! consecutive failures reach `max_failures`, or when at least
//! `min_samples` calls have been observed and the failure rate crosses
//! `failure_rate_threshold` percent. Open rejects calls outright with a
//! distinctive error until `timeout` has elapsed since the transition, at
//! which point the next call is admitted as a half-open probe. HalfOpen
//! admits at most `max_half_open_requests` concurrent probes; a single
//! failure reopens the breaker, while `success_threshold` consecutive
//! successes close it.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmesh::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//!
//! # async {
//! let breaker = CircuitBreaker::new("model-provider", CircuitBreakerConfig::default());
//!
//! let result: Result<String, _> = breaker
//!     .execute(|| async { Ok("completion".to_string()) })
//!     .await;
//!
//! assert!(result.is_ok());
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! # };
//! ```

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The breaker's position in its state graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow through; outcomes are recorded.
    Closed,
    /// Calls are rejected without reaching the downstream.
    Open,
    /// A bounded number of probe calls test whether the downstream recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Tuning knobs for a [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub max_failures: u32,
    /// Failure percentage (0–100) that opens the breaker once `min_samples`
    /// calls have been observed.
    pub failure_rate_threshold: f64,
    /// Minimum number of recorded calls before the rate rule applies.
    pub min_samples: u64,
    /// How long the breaker stays open before admitting a probe.
    pub timeout: Duration,
    /// Concurrent probes admitted while half-open.
    pub max_half_open_requests: u32,
    /// Consecutive probe successes required to close.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            failure_rate_threshold: 50.0,
            min_samples: 10,
            timeout: Duration::from_secs(30),
            max_half_open_requests: 1,
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Override the consecutive-failure budget (builder pattern).
    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    /// Override the failure-rate threshold in percent (builder pattern).
    pub fn with_failure_rate_threshold(mut self, threshold: f64) -> Self {
        self.failure_rate_threshold = threshold;
        self
    }

    /// Override the minimum sample count for the rate rule (builder pattern).
    pub fn with_min_samples(mut self, min_samples: u64) -> Self {
        self.min_samples = min_samples;
        self
    }

    /// Override the open period (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the half-open probe budget (builder pattern).
    pub fn with_max_half_open_requests(mut self, max: u32) -> Self {
        self.max_half_open_requests = max;
        self
    }

    /// Override the successes required to close (builder pattern).
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }
}

/// Error returned when the breaker rejects a call without running it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitOpen {
    /// Name of the breaker that rejected the call.
    pub name: String,
}

impl fmt::Display for CircuitOpen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circuit breaker is open: {}", self.name)
    }
}

impl Error for CircuitOpen {}

/// Point-in-time snapshot of a breaker's counters.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub state_changes: u64,
}

impl CircuitBreakerMetrics {
    /// Failure rate in percent over all recorded calls, 0.0 when no calls
    /// have been observed.
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.failed_calls as f64 / self.total_calls as f64 * 100.0
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    state_changes: u64,
    last_state_change: Instant,
    half_open_in_flight: u32,
}

impl BreakerInner {
    fn transition(&mut self, name: &str, to: CircuitState) {
        if self.state == to {
            return;
        }
        log::info!("circuit breaker '{}': {} -> {}", name, self.state, to);
        self.state = to;
        self.state_changes += 1;
        self.last_state_change = Instant::now();
        if to == CircuitState::HalfOpen {
            self.consecutive_successes = 0;
        }
        if to != CircuitState::HalfOpen {
            self.half_open_in_flight = 0;
        }
    }
}

/// A named three-state circuit breaker.
///
/// Cheap to share behind an `Arc`; all operations take `&self`.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker with the given display name and configuration.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                total_calls: 0,
                successful_calls: 0,
                failed_calls: 0,
                rejected_calls: 0,
                state_changes: 0,
                last_state_change: Instant::now(),
                half_open_in_flight: 0,
            }),
        }
    }

    /// Breaker name as supplied at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `op` through the breaker.
    ///
    /// Rejected calls fail with [`CircuitOpen`] without invoking `op`.
    /// Outcomes of admitted calls are recorded and drive state transitions.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, Box<dyn Error + Send + Sync>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Box<dyn Error + Send + Sync>>>,
    {
        self.before_call()?;
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(err)
            }
        }
    }

    fn before_call(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if inner.last_state_change.elapsed() >= self.config.timeout {
                    inner.transition(&self.name, CircuitState::HalfOpen);
                    inner.half_open_in_flight = 1;
                    Ok(())
                } else {
                    inner.rejected_calls += 1;
                    Err(Box::new(CircuitOpen {
                        name: self.name.clone(),
                    }))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.max_half_open_requests {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    inner.rejected_calls += 1;
                    Err(Box::new(CircuitOpen {
                        name: self.name.clone(),
                    }))
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_calls += 1;
        inner.successful_calls += 1;
        inner.consecutive_failures = 0;
        inner.consecutive_successes += 1;

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            if inner.consecutive_successes >= self.config.success_threshold {
                inner.transition(&self.name, CircuitState::Closed);
            }
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_calls += 1;
        inner.failed_calls += 1;
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.transition(&self.name, CircuitState::Open);
            }
            CircuitState::Closed => {
                let by_count = inner.consecutive_failures >= self.config.max_failures;
                let by_rate = inner.total_calls >= self.config.min_samples
                    && inner.failed_calls as f64 / inner.total_calls as f64 * 100.0
                        >= self.config.failure_rate_threshold;
                if by_count || by_rate {
                    inner.transition(&self.name, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// True when the breaker is open.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// True when the breaker is closed.
    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// True when the breaker is half-open.
    pub fn is_half_open(&self) -> bool {
        self.state() == CircuitState::HalfOpen
    }

    /// Time elapsed since the last state transition (or construction).
    pub fn time_since_state_change(&self) -> Duration {
        self.inner.lock().unwrap().last_state_change.elapsed()
    }

    /// Snapshot the breaker's counters.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock().unwrap();
        CircuitBreakerMetrics {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_calls: inner.total_calls,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
            rejected_calls: inner.rejected_calls,
            state_changes: inner.state_changes,
        }
    }

    /// Clear every counter and return to Closed without bumping the
    /// state-change counter for an already-closed breaker.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.transition(&self.name, CircuitState::Closed);
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.total_calls = 0;
        inner.successful_calls = 0;
        inner.failed_calls = 0;
        inner.rejected_calls = 0;
        inner.half_open_in_flight = 0;
    }

    /// Force the breaker open, bypassing the failure rules. Observable
    /// through [`CircuitBreaker::metrics`] as a state change.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.transition(&self.name, CircuitState::Open);
    }

    /// Force the breaker closed, bypassing the probe rules. Observable
    /// through [`CircuitBreaker::metrics`] as a state change.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.transition(&self.name, CircuitState::Closed);
        inner.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing() -> Result<(), Box<dyn Error + Send + Sync>> {
        Err("connection refused".into())
    }

    async fn fail_n(breaker: &CircuitBreaker, n: usize) {
        for _ in 0..n {
            let _ = breaker.execute(|| async { failing() }).await;
        }
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(
            "t",
            CircuitBreakerConfig::default().with_max_failures(3),
        );

        fail_n(&breaker, 2).await;
        assert!(breaker.is_closed());

        fail_n(&breaker, 1).await;
        assert!(breaker.is_open());
        assert_eq!(breaker.metrics().state_changes, 1);
    }

    #[tokio::test]
    async fn opens_on_failure_rate() {
        let cfg = CircuitBreakerConfig::default()
            .with_max_failures(100)
            .with_min_samples(4)
            .with_failure_rate_threshold(50.0);
        let breaker = CircuitBreaker::new("t", cfg);

        // 2 successes, then 2 failures: 50% at 4 samples.
        for _ in 0..2 {
            breaker.execute(|| async { Ok(()) }).await.unwrap();
        }
        fail_n(&breaker, 2).await;

        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn open_rejects_without_calling_downstream() {
        let breaker = CircuitBreaker::new(
            "model",
            CircuitBreakerConfig::default().with_max_failures(1),
        );
        fail_n(&breaker, 1).await;
        assert!(breaker.is_open());

        let called = std::sync::atomic::AtomicBool::new(false);
        let result: Result<(), _> = breaker
            .execute(|| {
                called.store(true, std::sync::atomic::Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("circuit breaker is open"));
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(breaker.metrics().rejected_calls, 1);
    }

    #[tokio::test]
    async fn half_open_after_timeout_then_closes_on_successes() {
        let cfg = CircuitBreakerConfig::default()
            .with_max_failures(1)
            .with_timeout(Duration::from_millis(10))
            .with_success_threshold(2)
            .with_max_half_open_requests(2);
        let breaker = CircuitBreaker::new("t", cfg);

        fail_n(&breaker, 1).await;
        assert!(breaker.is_open());

        tokio::time::sleep(Duration::from_millis(20)).await;

        breaker.execute(|| async { Ok(()) }).await.unwrap();
        assert!(breaker.is_half_open());

        breaker.execute(|| async { Ok(()) }).await.unwrap();
        assert!(breaker.is_closed());
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cfg = CircuitBreakerConfig::default()
            .with_max_failures(1)
            .with_timeout(Duration::from_millis(10));
        let breaker = CircuitBreaker::new("t", cfg);

        fail_n(&breaker, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = breaker.execute(|| async { failing() }).await;
        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn force_open_then_force_close_counts_two_transitions() {
        let breaker = CircuitBreaker::new("t", CircuitBreakerConfig::default());
        let before = breaker.metrics().state_changes;

        breaker.force_open();
        assert!(breaker.is_open());
        breaker.force_close();
        assert!(breaker.is_closed());

        assert_eq!(breaker.metrics().state_changes, before + 2);
    }

    #[tokio::test]
    async fn reset_clears_counters() {
        let breaker = CircuitBreaker::new(
            "t",
            CircuitBreakerConfig::default().with_max_failures(1),
        );
        fail_n(&breaker, 1).await;
        assert!(breaker.is_open());

        breaker.reset();
        assert!(breaker.is_closed());
        let m = breaker.metrics();
        assert_eq!(m.total_calls, 0);
        assert_eq!(m.failed_calls, 0);
        assert_eq!(m.failure_rate(), 0.0);
    }
}
