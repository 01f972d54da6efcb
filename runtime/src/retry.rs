//! Retry policy for restarting workers after transient broker failures.
//!
//! The default policy retries forever at a fixed 3 second interval. Every
//! knob is configurable so a deployment can bound the attempts or let the
//! delay grow.
//!
//! # Example
//!
//! ```rust
//! use analysis_orchestrator_runtime::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let fixed = RetryPolicy::default();
//! assert_eq!(fixed.delay_for_attempt(0), Duration::from_secs(3));
//! assert_eq!(fixed.delay_for_attempt(10), Duration::from_secs(3));
//!
//! let growing = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(500))
//!     .multiplier(2.0)
//!     .max_delay(Duration::from_secs(10))
//!     .build();
//! assert_eq!(growing.delay_for_attempt(2), Duration::from_secs(2));
//! assert!(!growing.allows_retry(5));
//! ```

use std::time::Duration;

const DEFAULT_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Retry policy configuration.
///
/// # Default Values
///
/// - `max_retries`: `None` (unbounded)
/// - `initial_delay`: 3 seconds
/// - `max_delay`: 60 seconds
/// - `multiplier`: 1.0 (no backoff growth)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries, `None` for unbounded
    pub max_retries: Option<usize>,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap for a growing delay
    pub max_delay: Duration,
    /// Growth factor applied per attempt
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_DELAY)
    }
}

impl RetryPolicy {
    /// Unbounded retries at a constant `delay`.
    #[must_use]
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            max_retries: None,
            initial_delay: delay,
            max_delay: if delay.as_nanos() > DEFAULT_MAX_DELAY.as_nanos() {
                delay
            } else {
                DEFAULT_MAX_DELAY
            },
            multiplier: 1.0,
        }
    }

    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
        }
    }

    /// Calculate delay for a given attempt number.
    ///
    /// Uses exponential backoff: delay = `initial_delay` * (multiplier ^ attempt),
    /// capped at `max_delay`. With the default multiplier of 1.0 every attempt
    /// waits `initial_delay`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 || (self.multiplier - 1.0).abs() < f64::EPSILON {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = attempt.min(i32::MAX as usize) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }

        Duration::from_millis(delay_ms as u64)
    }

    /// Whether another retry is allowed after `retries` retries so far.
    #[must_use]
    pub fn allows_retry(&self, retries: usize) -> bool {
        self.max_retries.is_none_or(|max| retries < max)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<usize>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Bound the number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::fixed(self.initial_delay.unwrap_or(DEFAULT_DELAY));
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: defaults.initial_delay,
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unbounded_three_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, None);
        assert!(policy.allows_retry(usize::MAX - 1));
        for attempt in [0, 1, 5, 1000] {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::from_secs(3));
        }
    }

    #[test]
    fn test_retry_policy_delay_calculation() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_secs(10))
            .build();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn test_retry_policy_max_delay_cap() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(1000))
            .multiplier(10.0)
            .max_delay(Duration::from_secs(2))
            .build();

        // 1000ms * 10^5 = 100,000,000ms, but capped at 2000ms
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(100_000), Duration::from_secs(2));
    }

    #[test]
    fn bounded_policy_counts_retries() {
        let policy = RetryPolicy::builder().max_retries(2).build();
        assert!(policy.allows_retry(0));
        assert!(policy.allows_retry(1));
        assert!(!policy.allows_retry(2));
    }

    #[test]
    fn fixed_delay_above_default_cap_is_not_clamped() {
        let policy = RetryPolicy::fixed(Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(120));
    }
}
