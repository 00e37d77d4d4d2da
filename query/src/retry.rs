use std::{fmt, future::Future, rc::Rc, time::Duration};

use crate::runtime;

/// How many times a failing producer is retried.
pub enum Retry<E> {
    /// Retry up to `n` times.
    Count(u32),
    /// Never retry.
    Never,
    /// Retry while the predicate holds for the latest error.
    Predicate(Rc<dyn Fn(&E) -> bool>),
}

const DEFAULT_RETRY_COUNT: u32 = 3;

impl<E> Retry<E> {
    /// Retry while `predicate` returns true.
    pub fn when(predicate: impl Fn(&E) -> bool + 'static) -> Self {
        Retry::Predicate(Rc::new(predicate))
    }

    /// Whether to retry after the `failure_count`-th consecutive failure.
    pub fn should_retry(&self, failure_count: u32, error: &E) -> bool {
        match self {
            Retry::Count(max_retries) => failure_count <= *max_retries,
            Retry::Never => false,
            Retry::Predicate(predicate) => predicate(error),
        }
    }
}

impl<E> Default for Retry<E> {
    fn default() -> Self {
        Retry::Count(DEFAULT_RETRY_COUNT)
    }
}

impl<E> Clone for Retry<E> {
    fn clone(&self) -> Self {
        match self {
            Retry::Count(n) => Retry::Count(*n),
            Retry::Never => Retry::Never,
            Retry::Predicate(predicate) => Retry::Predicate(predicate.clone()),
        }
    }
}

impl<E> From<u32> for Retry<E> {
    fn from(count: u32) -> Self {
        Retry::Count(count)
    }
}

/// `false` never retries, `true` retries forever.
impl<E> From<bool> for Retry<E> {
    fn from(retry: bool) -> Self {
        if retry {
            Retry::Count(u32::MAX)
        } else {
            Retry::Never
        }
    }
}

impl<E> fmt::Debug for Retry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retry::Count(n) => f.debug_tuple("Count").field(n).finish(),
            Retry::Never => write!(f, "Never"),
            Retry::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Exponential delay between attempts: `base * factor^n` for the n-th retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    max: Option<Duration>,
}

impl Backoff {
    /// Base delay before the first retry.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

    /// Doubling backoff starting at `base`.
    pub fn exponential(base: Duration) -> Self {
        Self {
            base,
            factor: 2.0,
            max: None,
        }
    }

    /// Set the growth factor.
    pub fn with_factor(self, factor: f64) -> Self {
        Self { factor, ..self }
    }

    /// Cap every delay at `max`.
    pub fn with_max(self, max: Duration) -> Self {
        Self {
            max: Some(max),
            ..self
        }
    }

    /// Delay before the retry with zero-based index `retry_index`.
    pub fn delay(&self, retry_index: u32) -> Duration {
        let multiplier = self.factor.powi(retry_index.min(i32::MAX as u32) as i32);
        let delay = Duration::try_from_secs_f64(self.base.as_secs_f64() * multiplier)
            .unwrap_or(Duration::MAX);
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::exponential(Backoff::DEFAULT_INTERVAL)
    }
}

/// Tracks consecutive failures of one execution and decides on the next delay.
pub(crate) struct RetryPolicy<E> {
    retry: Retry<E>,
    backoff: Backoff,
    failures: u32,
}

impl<E> RetryPolicy<E> {
    pub(crate) fn new(retry: Retry<E>, backoff: Backoff) -> Self {
        Self {
            retry,
            backoff,
            failures: 0,
        }
    }

    /// Records a failure. Returns the delay before retrying, or `None` once retries are spent.
    pub(crate) fn next(&mut self, error: &E) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.retry.should_retry(self.failures, error) {
            Some(self.backoff.delay(self.failures - 1))
        } else {
            None
        }
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }
}

/// Runs `attempt` until it succeeds or the policy gives up, sleeping between attempts.
pub(crate) async fn with_retry<V, E, F, Fu>(mut policy: RetryPolicy<E>, mut attempt: F) -> Result<V, E>
where
    F: FnMut() -> Fu,
    Fu: Future<Output = Result<V, E>>,
{
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(error) => match policy.next(&error) {
                Some(delay) => {
                    tracing::debug!(
                        failures = policy.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "retrying after failure"
                    );
                    runtime::sleep(delay).await;
                }
                None => return Err(error),
            },
        }
    }
}
