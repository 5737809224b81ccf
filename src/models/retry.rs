// src/models/retry.rs

//! Retry policy for paginated fetches.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the harvester reacts to a failed page request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Consecutive failures on one target before it is abandoned
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    /// Delay curve applied between retries of the same page
    #[serde(default)]
    pub backoff: Backoff,

    /// Also sleep after transport/decode failures, not only after
    /// explicit non-200 answers
    #[serde(default)]
    pub delay_on_transport_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_errors: default_max_consecutive_errors(),
            backoff: Backoff::default(),
            delay_on_transport_errors: false,
        }
    }
}

fn default_max_consecutive_errors() -> u32 {
    3
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests and dry runs.
    pub fn immediate(max_consecutive_errors: u32) -> Self {
        Self {
            max_consecutive_errors,
            backoff: Backoff {
                curve: BackoffCurve::Fixed,
                base_delay_ms: 0,
                max_delay_ms: 0,
            },
            delay_on_transport_errors: false,
        }
    }

    /// Whether `consecutive_errors` failures exhaust the target.
    pub fn exhausted(&self, consecutive_errors: u32) -> bool {
        consecutive_errors >= self.max_consecutive_errors
    }

    /// Delay before retrying, or `None` when no sleep applies.
    pub fn delay_for(&self, consecutive_errors: u32, explicit: bool) -> Option<Duration> {
        if !explicit && !self.delay_on_transport_errors {
            return None;
        }
        let delay = self.backoff.delay(consecutive_errors);
        (!delay.is_zero()).then_some(delay)
    }
}

/// Shape of the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffCurve {
    /// Always `base_delay_ms`
    #[default]
    Fixed,
    /// `base_delay_ms * attempt`
    Linear,
    /// `base_delay_ms * 2^(attempt - 1)`
    Exponential,
}

/// Backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(default)]
    pub curve: BackoffCurve,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            curve: BackoffCurve::Fixed,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Backoff {
    /// Delay after the `attempt`-th consecutive failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let ms = match self.curve {
            BackoffCurve::Fixed => self.base_delay_ms,
            BackoffCurve::Linear => self.base_delay_ms.saturating_mul(u64::from(attempt)),
            BackoffCurve::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(curve: BackoffCurve) -> Backoff {
        Backoff {
            curve,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        }
    }

    #[test]
    fn test_fixed_curve() {
        let b = backoff(BackoffCurve::Fixed);
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(5), Duration::from_millis(100));
    }

    #[test]
    fn test_linear_curve() {
        let b = backoff(BackoffCurve::Linear);
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(3), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_curve_is_capped() {
        let b = backoff(BackoffCurve::Exponential);
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(2), Duration::from_millis(200));
        assert_eq!(b.delay(4), Duration::from_millis(800));
        assert_eq!(b.delay(5), Duration::from_millis(1_000));
        assert_eq!(b.delay(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_transport_errors_skip_delay_by_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1, true), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(1, false), None);
    }

    #[test]
    fn test_exhaustion_threshold() {
        let policy = RetryPolicy::default();
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
    }

    #[test]
    fn test_policy_from_toml() {
        let policy: RetryPolicy = toml::from_str(
            r#"
            max_consecutive_errors = 5
            delay_on_transport_errors = true

            [backoff]
            curve = "exponential"
            base_delay_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(policy.max_consecutive_errors, 5);
        assert_eq!(policy.backoff.curve, BackoffCurve::Exponential);
        assert_eq!(policy.backoff.max_delay_ms, 30_000);
        assert_eq!(policy.delay_for(2, false), Some(Duration::from_millis(500)));
    }
}
