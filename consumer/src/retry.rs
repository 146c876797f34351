//! Backoff between apply attempts of one message.
//!
//! A failed apply is retried in place instead of being redelivered, so the
//! schedule here is the only thing spacing out calls to a struggling mentor
//! service.
//!
//! ```
//! use mentor_rating_consumer::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(5))
//!     .build();
//!
//! assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
//! assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
//! assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
//! ```

use std::time::Duration;

const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_FACTOR: f64 = 2.0;

/// Exponential backoff schedule: 100ms doubling up to 30s unless configured.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor per failure
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            factor: DEFAULT_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Start from the defaults.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Delay after failure number `attempt` (0-based), capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scale = self.factor.powi(exponent);
        let delay = Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * scale).unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Delay after the first failure.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Upper bound for any single delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Growth factor per failure; values below 1 are treated as 1.
    #[must_use]
    pub const fn factor(mut self, factor: f64) -> Self {
        self.policy.factor = factor;
        self
    }

    /// Finish.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let mut policy = self.policy;
        if policy.factor.is_nan() || policy.factor < 1.0 {
            policy.factor = 1.0;
        }
        policy
    }
}
