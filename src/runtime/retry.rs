//! Activity retry configuration.
use std::time::Duration;

/// Delay between activity attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    /// Same delay before every retry.
    Fixed { delay: Duration },
    /// `base * attempt`, capped at `max`.
    Linear { base: Duration, max: Duration },
    /// `base * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffStrategy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => base.saturating_mul(attempt).min(*max),
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let exp = attempt.saturating_sub(1) as i32;
                let secs = base.as_secs_f64() * multiplier.powi(exp);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
        }
    }
}

/// How many times an activity runs and how long each attempt may take.
///
/// ```rust
/// use duratask::{BackoffStrategy, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(4)
///     .with_timeout(Duration::from_secs(5))
///     .with_backoff(BackoffStrategy::Fixed { delay: Duration::from_millis(200) });
/// assert_eq!(policy.max_attempts, 4);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Per-attempt timeout. `None` lets an attempt run until it finishes.
    pub timeout: Option<Duration>,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: None,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// # Panics
    ///
    /// Panics if `max_attempts` is zero.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Upper bound on wall time spent retrying, excluding attempts without a
    /// timeout. Used to size the worker lock.
    pub fn worst_case_duration(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let running = self.timeout.unwrap_or_default().saturating_mul(attempts);
        (1..attempts).fold(running, |acc, n| acc.saturating_add(self.backoff.delay_for_attempt(n)))
    }
}
