//! Retry decisions and backoff delays for failed fetch attempts.
//!
//! Attempt indices count retries: the first failure of a cycle has index `0`,
//! the second `1`, and so on. The default delay doubles from one second per
//! index and is capped by the configured maximum, without jitter.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::QueryError;

/// Base of the default exponential delay.
const BASE_DELAY_MS: u64 = 1000;

/// Custom retry predicate receiving the attempt index and the last error.
pub type RetryPredicate = Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>;

/// Custom delay function receiving the attempt index and the last error.
pub type RetryDelayFn = Arc<dyn Fn(u32, &QueryError) -> Duration + Send + Sync>;

/// How long to wait before a retry.
#[derive(Clone, Default)]
pub enum RetryDelay {
    /// `min(1000ms * 2^index, max_delay)`.
    #[default]
    Exponential,
    Fixed(Duration),
    Custom(RetryDelayFn),
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exponential => f.write_str("Exponential"),
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Retry configuration resolved for one query instance.
#[derive(Clone)]
pub struct RetryPolicy {
    pub infinite: bool,
    pub count: Option<u32>,
    pub predicate: Option<RetryPredicate>,
    pub delay: RetryDelay,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn never() -> Self {
        Self {
            infinite: false,
            count: None,
            predicate: None,
            delay: RetryDelay::Exponential,
            max_delay: Duration::from_secs(30),
        }
    }

    /// A policy retrying up to `count` times with the default delay.
    #[must_use]
    pub const fn bounded(count: u32, max_delay: Duration) -> Self {
        Self {
            infinite: false,
            count: Some(count),
            predicate: None,
            delay: RetryDelay::Exponential,
            max_delay,
        }
    }

    /// Decides whether the attempt that just failed with `error` is retried.
    ///
    /// Infinite retry wins, then a bounded count, then the custom predicate.
    #[must_use]
    pub fn should_retry(&self, attempt_index: u32, error: &QueryError) -> bool {
        if !error.is_retryable() {
            return false;
        }
        if self.infinite {
            return true;
        }
        if let Some(count) = self.count {
            if attempt_index < count {
                return true;
            }
        }
        self.predicate
            .as_ref()
            .is_some_and(|predicate| predicate(attempt_index, error))
    }

    /// Computes the wait before retry number `attempt_index`.
    #[must_use]
    pub fn delay(&self, attempt_index: u32, error: &QueryError) -> Duration {
        match &self.delay {
            RetryDelay::Exponential => exponential_delay(attempt_index, self.max_delay),
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::Custom(f) => f(attempt_index, error),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(3, Duration::from_secs(30))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("infinite", &self.infinite)
            .field("count", &self.count)
            .field("predicate", &self.predicate.as_ref().map(|_| ".."))
            .field("delay", &self.delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

/// Default backoff: `min(1000ms * 2^attempt_index, max_delay)`, saturating.
#[must_use]
pub fn exponential_delay(attempt_index: u32, max_delay: Duration) -> Duration {
    let factor = 1u64.checked_shl(attempt_index).unwrap_or(u64::MAX);
    Duration::from_millis(BASE_DELAY_MS.saturating_mul(factor)).min(max_delay)
}
