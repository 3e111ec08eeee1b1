//! Retry with exponential backoff and jitter.
//!
//! Transient failures (a tool server restarting, a connection reset, a
//! request that timed out) are retried with exponentially growing sleeps
//! between attempts. Whether an error is transient is decided by
//! [`is_retryable`], a pure function over the error's rendered message, so
//! callers and tests can reason about classification without constructing
//! transport state.
//!
//! Every sleep honours the caller's [`CancellationToken`]: cancellation is
//! observed both between attempts and in the middle of a backoff sleep, and
//! surfaces as [`Cancelled`], a distinguished error that is never itself
//! classified as retryable.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmesh::retry::{with_retry, RetryConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async {
//! let cfg = RetryConfig::default().with_max_retries(5);
//! let token = CancellationToken::new();
//!
//! let value = with_retry(&cfg, &token, |attempt| async move {
//!     if attempt < 2 {
//!         Err("connection refused".into())
//!     } else {
//!         Ok(42u32)
//!     }
//! })
//! .await?;
//!
//! assert_eq!(value, 42);
//! # Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
//! # };
//! ```

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Message fragments that mark an error as transient.
///
/// The classification is intentionally string-based: errors cross the
/// `Box<dyn Error + Send + Sync>` seam between transports, pools, and the
/// orchestrator, and the rendered message is the one property every layer
/// preserves.
const RETRYABLE_FRAGMENTS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "broken pipe",
    "timeout",
    "timed out",
    "temporarily unavailable",
    "service unavailable",
    "too many requests",
    "no route to host",
    "host unreachable",
    "network",
    "eof",
];

/// Configuration for [`with_retry`].
///
/// `max_retries` counts retries, not attempts: a value of 3 allows up to
/// four executions of the operation. The sleep before retry `n` is
/// `backoff × multiplier^n`, clamped to `max_backoff`, and jittered by
/// ±25% when `jitter` is enabled.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Base sleep before the first retry.
    pub backoff: Duration,
    /// Exponential growth factor applied per retry.
    pub multiplier: f64,
    /// Upper bound on any single sleep.
    pub max_backoff: Duration,
    /// Whether to jitter each sleep by ±25%.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Override the retry budget (builder pattern).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override the base backoff (builder pattern).
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Override the exponential multiplier (builder pattern).
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Override the backoff ceiling (builder pattern).
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Enable or disable jitter (builder pattern).
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Compute the sleep preceding retry number `attempt` (0-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt as i32);
        let base = self.backoff.as_secs_f64() * exp;
        let capped = base.min(self.max_backoff.as_secs_f64());
        let factor = if self.jitter {
            rand::rng().random_range(0.75..=1.25)
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * factor).max(0.0))
    }
}

/// Distinguished error produced when a cooperative cancellation signal
/// fires inside a retried operation or its backoff sleep.
///
/// `Cancelled` is deliberately excluded from [`is_retryable`] so that a
/// shutdown is never mistaken for a transient network failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl Error for Cancelled {}

/// Errors terminating a [`with_retry`] call without a successful result.
#[derive(Debug)]
pub enum RetryError {
    /// Every attempt failed with a retryable error; carries the number of
    /// attempts made and the last underlying error.
    Exhausted {
        attempts: u32,
        source: Box<dyn Error + Send + Sync>,
    },
}

impl fmt::Display for RetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, source } => {
                write!(f, "retry budget exhausted after {} attempts: {}", attempts, source)
            }
        }
    }
}

impl Error for RetryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RetryError::Exhausted { source, .. } => Some(source.as_ref()),
        }
    }
}

/// Classify an error as transient (worth retrying) or permanent.
///
/// A pure function of the rendered message: case-insensitive containment
/// of any fragment in the retryable table. Cancellation is always
/// permanent, regardless of message text.
pub fn is_retryable(err: &(dyn Error + 'static)) -> bool {
    if err.is::<Cancelled>() {
        return false;
    }
    let msg = err.to_string().to_lowercase();
    RETRYABLE_FRAGMENTS.iter().any(|f| msg.contains(f))
}

/// Returns true when the error is the distinguished [`Cancelled`] marker.
pub fn is_cancelled(err: &(dyn Error + 'static)) -> bool {
    err.is::<Cancelled>()
}

/// Run `op` until it succeeds, fails permanently, exhausts the retry
/// budget, or is cancelled.
///
/// The operation receives the 0-based attempt number. Failures classified
/// by [`is_retryable`] trigger a backoff sleep and another attempt;
/// everything else is returned to the caller immediately. The cancellation
/// token is checked before each attempt and raced against each sleep.
pub async fn with_retry<T, F, Fut>(
    cfg: &RetryConfig,
    token: &CancellationToken,
    mut op: F,
) -> Result<T, Box<dyn Error + Send + Sync>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Box<dyn Error + Send + Sync>>>,
{
    let mut attempt: u32 = 0;
    loop {
        if token.is_cancelled() {
            return Err(Box::new(Cancelled));
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if is_cancelled(err.as_ref()) {
                    return Err(err);
                }
                if !is_retryable(err.as_ref()) {
                    return Err(err);
                }
                if attempt >= cfg.max_retries {
                    return Err(Box::new(RetryError::Exhausted {
                        attempts: attempt + 1,
                        source: err,
                    }));
                }

                let sleep = cfg.backoff_for(attempt);
                log::debug!(
                    "retryable failure on attempt {} ({}); backing off {:?}",
                    attempt + 1,
                    err,
                    sleep
                );

                tokio::select! {
                    _ = token.cancelled() => return Err(Box::new(Cancelled)),
                    _ = tokio::time::sleep(sleep) => {}
                }
                attempt += 1;
            }
        }
    }
}
