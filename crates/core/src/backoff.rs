//! Backoff policies: attempt count -> retry delay.
//!
//! The orchestrator never hard-codes a delay curve; it asks a `BackoffPolicy`
//! when the next attempt is due. Whether another attempt is allowed at all is
//! [`should_retry`], which only looks at the record's attempt budget.
//! Policies are pure (no IO, no clock other than the `now` passed in).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::failed_event::FailedEventRecord;

/// Maps an attempt count to a retry delay.
pub trait BackoffPolicy: Send + Sync + core::fmt::Debug {
    /// Delay before the next attempt, given how many attempts were already made.
    fn delay(&self, attempt_count: u32) -> Duration;

    /// `now + delay(attempt_count)`, saturating at the maximum representable instant.
    fn next_retry_at_from(&self, now: DateTime<Utc>, attempt_count: u32) -> DateTime<Utc> {
        chrono::Duration::from_std(self.delay(attempt_count))
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Next retry timestamp relative to the current wall clock.
    fn next_retry_at(&self, attempt_count: u32) -> DateTime<Utc> {
        self.next_retry_at_from(Utc::now(), attempt_count)
    }
}

/// Whether the record may be attempted again: `attempt_count < max_attempts`.
pub fn should_retry(record: &FailedEventRecord) -> bool {
    !record.attempts_exhausted()
}

impl<P> BackoffPolicy for Arc<P>
where
    P: BackoffPolicy + ?Sized,
{
    fn delay(&self, attempt_count: u32) -> Duration {
        (**self).delay(attempt_count)
    }
}

/// `min(base * multiplier^attempt_count, cap)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, multiplier: f64, cap: Duration) -> Self {
        Self {
            base,
            multiplier,
            cap,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            multiplier: 2.0,
            cap: Duration::from_millis(60_000),
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt_count: u32) -> Duration {
        let exp = i32::try_from(attempt_count).unwrap_or(i32::MAX);
        let cap_ns = self.cap.as_nanos() as f64;
        let delay_ns = self.base.as_nanos() as f64 * self.multiplier.powi(exp);

        if !delay_ns.is_finite() || delay_ns >= cap_ns {
            return self.cap;
        }
        Duration::from_nanos(delay_ns.max(0.0) as u64)
    }
}

/// `min(base + increment * attempt_count, cap)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    pub base: Duration,
    pub increment: Duration,
    pub cap: Duration,
}

impl LinearBackoff {
    pub fn new(base: Duration, increment: Duration, cap: Duration) -> Self {
        Self {
            base,
            increment,
            cap,
        }
    }
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            increment: Duration::from_millis(1_000),
            cap: Duration::from_millis(60_000),
        }
    }
}

impl BackoffPolicy for LinearBackoff {
    fn delay(&self, attempt_count: u32) -> Duration {
        self.increment
            .checked_mul(attempt_count)
            .and_then(|inc| self.base.checked_add(inc))
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

/// Constant delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    pub interval: Duration,
}

impl FixedBackoff {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5_000),
        }
    }
}

impl BackoffPolicy for FixedBackoff {
    fn delay(&self, _attempt_count: u32) -> Duration {
        self.interval
    }
}

/// Serializable backoff selection (configuration files, env).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffConfig {
    Exponential {
        base_ms: u64,
        multiplier: f64,
        cap_ms: u64,
    },
    Linear {
        base_ms: u64,
        increment_ms: u64,
        cap_ms: u64,
    },
    Fixed {
        interval_ms: u64,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            base_ms: 1_000,
            multiplier: 2.0,
            cap_ms: 60_000,
        }
    }
}

impl BackoffConfig {
    /// Build the configured policy.
    pub fn build(&self) -> DomainResult<Arc<dyn BackoffPolicy>> {
        match *self {
            BackoffConfig::Exponential {
                base_ms,
                multiplier,
                cap_ms,
            } => {
                if !multiplier.is_finite() || multiplier < 1.0 {
                    return Err(DomainError::validation(format!(
                        "exponential multiplier must be >= 1.0, got {multiplier}"
                    )));
                }
                check_cap(base_ms, cap_ms)?;
                Ok(Arc::new(ExponentialBackoff::new(
                    Duration::from_millis(base_ms),
                    multiplier,
                    Duration::from_millis(cap_ms),
                )))
            }
            BackoffConfig::Linear {
                base_ms,
                increment_ms,
                cap_ms,
            } => {
                check_cap(base_ms, cap_ms)?;
                Ok(Arc::new(LinearBackoff::new(
                    Duration::from_millis(base_ms),
                    Duration::from_millis(increment_ms),
                    Duration::from_millis(cap_ms),
                )))
            }
            BackoffConfig::Fixed { interval_ms } => Ok(Arc::new(FixedBackoff::new(
                Duration::from_millis(interval_ms),
            ))),
        }
    }
}

fn check_cap(base_ms: u64, cap_ms: u64) -> DomainResult<()> {
    if cap_ms < base_ms {
        return Err(DomainError::validation(format!(
            "backoff cap ({cap_ms}ms) is below the base delay ({base_ms}ms)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failed_event::{FailureReason, NewFailedEvent};
    use proptest::prelude::*;

    fn record(attempt_count: u32, max_attempts: u32) -> FailedEventRecord {
        let mut record = FailedEventRecord::new(
            NewFailedEvent::new(
                serde_json::json!({}),
                "topic1",
                FailureReason::new("boom"),
            )
            .with_max_attempts(max_attempts),
            Utc::now(),
        )
        .unwrap();
        record.attempt_count = attempt_count;
        record
    }

    #[test]
    fn exponential_defaults_double_until_cap() {
        let policy = ExponentialBackoff::default();

        assert_eq!(policy.delay(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay(2), Duration::from_millis(4_000));
        assert_eq!(policy.delay(5), Duration::from_millis(32_000));
        assert_eq!(policy.delay(6), Duration::from_millis(60_000));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(60_000));
    }

    #[test]
    fn exponential_keeps_sub_millisecond_precision() {
        let policy = ExponentialBackoff::new(
            Duration::from_micros(500),
            2.0,
            Duration::from_millis(10),
        );

        assert_eq!(policy.delay(0), Duration::from_micros(500));
        assert_eq!(policy.delay(1), Duration::from_millis(1));
        assert_eq!(policy.delay(3), Duration::from_millis(4));
        assert_eq!(policy.delay(10), Duration::from_millis(10));

        let fractional = ExponentialBackoff::new(Duration::from_micros(1_500), 1.5, Duration::from_secs(1));
        assert_eq!(fractional.delay(1), Duration::from_micros(2_250));
    }

    #[test]
    fn linear_grows_by_increment() {
        let policy = LinearBackoff::new(
            Duration::from_millis(500),
            Duration::from_millis(250),
            Duration::from_secs(2),
        );

        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(750));
        assert_eq!(policy.delay(4), Duration::from_millis(1_500));
        assert_eq!(policy.delay(10), Duration::from_secs(2));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn fixed_is_constant() {
        let policy = FixedBackoff::new(Duration::from_millis(750));

        assert_eq!(policy.delay(0), Duration::from_millis(750));
        assert_eq!(policy.delay(3), Duration::from_millis(750));
        assert_eq!(policy.delay(300), Duration::from_millis(750));
    }

    #[test]
    fn next_retry_at_adds_delay_to_now() {
        let policy = ExponentialBackoff::default();
        let now = Utc::now();

        assert_eq!(
            policy.next_retry_at_from(now, 2),
            now + chrono::Duration::milliseconds(4_000)
        );
        assert_eq!(
            policy.next_retry_at_from(DateTime::<Utc>::MAX_UTC, 0),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        assert!(should_retry(&record(0, 3)));
        assert!(should_retry(&record(2, 3)));
        assert!(!should_retry(&record(3, 3)));
        assert!(!should_retry(&record(4, 3)));
        assert!(!should_retry(&record(1, 1)));
    }

    #[test]
    fn config_builds_matching_policy() {
        let policy = BackoffConfig::Linear {
            base_ms: 100,
            increment_ms: 100,
            cap_ms: 1_000,
        }
        .build()
        .unwrap();
        assert_eq!(policy.delay(3), Duration::from_millis(400));

        let policy = BackoffConfig::default().build().unwrap();
        assert_eq!(policy.delay(1), Duration::from_millis(2_000));
    }

    #[test]
    fn config_rejects_shrinking_or_inverted_curves() {
        let shrinking = BackoffConfig::Exponential {
            base_ms: 1_000,
            multiplier: 0.5,
            cap_ms: 60_000,
        };
        assert!(matches!(shrinking.build(), Err(DomainError::Validation(_))));

        let inverted = BackoffConfig::Linear {
            base_ms: 5_000,
            increment_ms: 1,
            cap_ms: 1_000,
        };
        assert!(matches!(inverted.build(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn config_deserializes_from_tagged_json() {
        let cfg: BackoffConfig = serde_json::from_value(serde_json::json!({
            "strategy": "fixed",
            "interval_ms": 250
        }))
        .unwrap();
        assert_eq!(cfg, BackoffConfig::Fixed { interval_ms: 250 });
    }

    proptest! {
        #[test]
        fn exponential_matches_closed_form(
            base_ms in 1u64..5_000,
            cap_ms in 5_000u64..600_000,
            n in 0u32..40,
        ) {
            let policy = ExponentialBackoff::new(
                Duration::from_millis(base_ms),
                2.0,
                Duration::from_millis(cap_ms),
            );
            let expected = base_ms
                .checked_mul(2u64.saturating_pow(n))
                .map_or(cap_ms, |d| d.min(cap_ms));
            prop_assert_eq!(policy.delay(n), Duration::from_millis(expected));
        }

        #[test]
        fn delays_never_exceed_cap_and_never_shrink(n in 0u32..1_000) {
            let exp = ExponentialBackoff::default();
            let lin = LinearBackoff::default();

            prop_assert!(exp.delay(n) <= exp.cap);
            prop_assert!(lin.delay(n) <= lin.cap);
            prop_assert!(exp.delay(n + 1) >= exp.delay(n));
            prop_assert!(lin.delay(n + 1) >= lin.delay(n));
        }
    }
}
