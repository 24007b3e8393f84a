//! Retry policies for automatic reconnection.
//!
//! A retry policy is a pure decision: given how long the connection has
//! been trying and how many attempts failed, return the delay before the
//! next attempt or `None` to give up. The hub connection owns the loop,
//! the timer, and the callbacks; the policy never sees any of them, which
//! keeps it trivially testable.
//!
//! ```rust
//! use std::time::Duration;
//! use hubwire::{DefaultRetryPolicy, HubError, RetryContext, RetryPolicy};
//!
//! let policy = DefaultRetryPolicy::with_delays(vec![Duration::ZERO]);
//! let reason = HubError::Timeout;
//! let first = RetryContext {
//!     previous_retry_count: 0,
//!     elapsed: Duration::ZERO,
//!     retry_reason: &reason,
//! };
//! assert_eq!(policy.next_retry_delay(&first), Some(Duration::ZERO));
//! ```

use std::time::Duration;

use rand::Rng;

use crate::HubError;

/// What a [`RetryPolicy`] knows when it decides.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext<'a> {
    /// Reconnect attempts that already failed in this reconnect cycle.
    pub previous_retry_count: u32,
    /// Time since the connection was lost.
    pub elapsed: Duration,
    /// The error that caused the disconnect or the last failed attempt.
    pub retry_reason: &'a HubError,
}

/// Decides whether and when to try reconnecting.
///
/// ## Trait bounds
///
/// `Send + Sync + 'static` because the policy is shared with the task
/// that drives the connection.
pub trait RetryPolicy: Send + Sync + 'static {
    /// The delay before the next attempt, or `None` to stop reconnecting.
    fn next_retry_delay(&self, context: &RetryContext<'_>) -> Option<Duration>;
}

impl<F> RetryPolicy for F
where
    F: Fn(&RetryContext<'_>) -> Option<Duration> + Send + Sync + 'static,
{
    fn next_retry_delay(&self, context: &RetryContext<'_>) -> Option<Duration> {
        self(context)
    }
}

/// The delays used by [`DefaultRetryPolicy::default`]: 0, 2, 10 and 30
/// seconds.
pub const DEFAULT_RETRY_DELAYS: [Duration; 4] = [
    Duration::ZERO,
    Duration::from_secs(2),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

/// Walks a fixed list of delays, then gives up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRetryPolicy {
    delays: Vec<Duration>,
}

impl DefaultRetryPolicy {
    /// A policy that waits `delays[n]` before attempt `n` and gives up
    /// after the last one.
    pub fn with_delays(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self::with_delays(DEFAULT_RETRY_DELAYS.to_vec())
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn next_retry_delay(&self, context: &RetryContext<'_>) -> Option<Duration> {
        self.delays
            .get(context.previous_retry_count as usize)
            .copied()
    }
}

/// Exponential backoff with jitter, bounded by attempts and elapsed time.
///
/// The delay before attempt `n` is `min(base * factor^n, max)` scaled by a
/// random factor in `[1 - jitter, 1 + jitter]`, so clients that lost the
/// same server at the same moment do not all come back at once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialRetryPolicy {
    base: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    max_attempts: Option<u32>,
    max_elapsed: Option<Duration>,
}

impl ExponentialRetryPolicy {
    /// Creates a policy with the given growth parameters and no limits.
    ///
    /// Delays never shrink: a `factor` below 1 (or NaN) becomes 1, and a
    /// `max` below `base` becomes `base`. `jitter` is clamped to
    /// `0.0..=1.0`, with NaN meaning none.
    pub fn new(base: Duration, max: Duration, factor: f64, jitter: f64) -> Self {
        let factor = if factor >= 1.0 { factor } else { 1.0 };
        let jitter = if jitter.is_nan() { 0.0 } else { jitter.clamp(0.0, 1.0) };
        Self {
            base,
            max: max.max(base),
            factor,
            jitter,
            max_attempts: None,
            max_elapsed: None,
        }
    }

    /// Gives up once this many attempts have failed.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Gives up once the connection has been lost for this long.
    pub fn max_elapsed(mut self, elapsed: Duration) -> Self {
        self.max_elapsed = Some(elapsed);
        self
    }

    fn jitter_factor(&self) -> f64 {
        if self.jitter == 0.0 {
            return 1.0;
        }
        rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter))
    }
}

impl Default for ExponentialRetryPolicy {
    /// 500ms base, doubling, capped at 30 seconds, ±20% jitter, no limits.
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 2.0, 0.2)
    }
}

impl RetryPolicy for ExponentialRetryPolicy {
    fn next_retry_delay(&self, context: &RetryContext<'_>) -> Option<Duration> {
        if self
            .max_attempts
            .is_some_and(|max| context.previous_retry_count >= max)
        {
            return None;
        }
        if self.max_elapsed.is_some_and(|max| context.elapsed >= max) {
            return None;
        }

        let exponent = i32::try_from(context.previous_retry_count).unwrap_or(i32::MAX);
        let growth = self.factor.powi(exponent);
        let delay = Duration::try_from_secs_f64(self.base.as_secs_f64() * growth)
            .map_or(self.max, |delay| delay.min(self.max));
        Some(
            Duration::try_from_secs_f64(delay.as_secs_f64() * self.jitter_factor())
                .unwrap_or(delay),
        )
    }
}
