//! Retry layer configuration.
//!
//! Read from `FAILED_EVENTS_*` environment variables; every variable is
//! optional and falls back to the defaults below.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `FAILED_EVENTS_SWEEP_INTERVAL_MS` | `30000` |
//! | `FAILED_EVENTS_WARMUP_DELAY_MS` | `5000` |
//! | `FAILED_EVENTS_BATCH_SIZE` | `100` |
//! | `FAILED_EVENTS_MAX_ATTEMPTS` | `3` |
//! | `FAILED_EVENTS_BACKOFF` | `exponential` (`linear`, `fixed`) |
//! | `FAILED_EVENTS_BACKOFF_BASE_MS` | `1000` (the interval for `fixed`) |
//! | `FAILED_EVENTS_BACKOFF_MULTIPLIER` | `2` |
//! | `FAILED_EVENTS_BACKOFF_INCREMENT_MS` | `1000` |
//! | `FAILED_EVENTS_BACKOFF_CAP_MS` | `60000` |
//! | `FAILED_EVENTS_AUTO_RETRY` | `true` |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use redeliver_core::{BackoffConfig, DEFAULT_MAX_ATTEMPTS};

use crate::failed_events::{DEFAULT_BATCH_SIZE, FailedEventStore, RetryOrchestrator, SweepConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub sweep_interval_ms: u64,
    pub warmup_delay_ms: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    /// Start the sweep timer on boot.
    pub auto_retry: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 30_000,
            warmup_delay_ms: 5_000,
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffConfig::default(),
            auto_retry: true,
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        let sweep_interval_ms = parse_or(&get, "FAILED_EVENTS_SWEEP_INTERVAL_MS", defaults.sweep_interval_ms)?;
        if sweep_interval_ms == 0 {
            return Err(invalid("FAILED_EVENTS_SWEEP_INTERVAL_MS", "must be greater than zero"));
        }
        let warmup_delay_ms = parse_or(&get, "FAILED_EVENTS_WARMUP_DELAY_MS", defaults.warmup_delay_ms)?;
        let batch_size = parse_or(&get, "FAILED_EVENTS_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err(invalid("FAILED_EVENTS_BATCH_SIZE", "must be greater than zero"));
        }
        let max_attempts = parse_or(&get, "FAILED_EVENTS_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(invalid("FAILED_EVENTS_MAX_ATTEMPTS", "must be at least 1"));
        }
        let auto_retry = match get("FAILED_EVENTS_AUTO_RETRY") {
            None => defaults.auto_retry,
            Some(v) => parse_bool(&v)
                .ok_or_else(|| invalid("FAILED_EVENTS_AUTO_RETRY", format!("not a boolean: {v}")))?,
        };

        let base_ms = parse_or(&get, "FAILED_EVENTS_BACKOFF_BASE_MS", 1_000u64)?;
        let cap_ms = parse_or(&get, "FAILED_EVENTS_BACKOFF_CAP_MS", 60_000u64)?;
        let strategy = get("FAILED_EVENTS_BACKOFF").map(|v| v.trim().to_ascii_lowercase());
        let backoff = match strategy.as_deref() {
            None | Some("exponential") => BackoffConfig::Exponential {
                base_ms,
                multiplier: parse_or(&get, "FAILED_EVENTS_BACKOFF_MULTIPLIER", 2.0f64)?,
                cap_ms,
            },
            Some("linear") => BackoffConfig::Linear {
                base_ms,
                increment_ms: parse_or(&get, "FAILED_EVENTS_BACKOFF_INCREMENT_MS", 1_000u64)?,
                cap_ms,
            },
            Some("fixed") => BackoffConfig::Fixed { interval_ms: base_ms },
            Some(other) => {
                return Err(invalid(
                    "FAILED_EVENTS_BACKOFF",
                    format!("unknown strategy {other:?} (expected exponential, linear or fixed)"),
                ));
            }
        };
        backoff
            .build()
            .map_err(|e| invalid("FAILED_EVENTS_BACKOFF", e.to_string()))?;

        Ok(Self {
            sweep_interval_ms,
            warmup_delay_ms,
            batch_size,
            max_attempts,
            backoff,
            auto_retry,
        })
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            interval: Duration::from_millis(self.sweep_interval_ms),
            warmup_delay: Duration::from_millis(self.warmup_delay_ms),
        }
    }

    /// Orchestrator over `store` with this configuration's policy and limits.
    pub fn orchestrator<S: FailedEventStore>(&self, store: S) -> Result<RetryOrchestrator<S>, ConfigError> {
        let policy = self
            .backoff
            .build()
            .map_err(|e| invalid("FAILED_EVENTS_BACKOFF", e.to_string()))?;
        Ok(RetryOrchestrator::with_policy(store, policy)
            .with_batch_size(self.batch_size)
            .with_default_max_attempts(self.max_attempts))
    }
}

fn invalid(var: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        reason: reason.into(),
    }
}

fn parse_or<T>(
    get: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| invalid(var, format!("{raw:?}: {e}"))),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failed_events::InMemoryFailedEventStore;
    use redeliver_core::BackoffPolicy;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<RetryConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RetryConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg, RetryConfig::default());
        assert_eq!(cfg.sweep_config(), SweepConfig::default());
    }

    #[test]
    fn linear_strategy_is_read_from_env() {
        let cfg = from_pairs(&[
            ("FAILED_EVENTS_BACKOFF", "Linear"),
            ("FAILED_EVENTS_BACKOFF_BASE_MS", "200"),
            ("FAILED_EVENTS_BACKOFF_INCREMENT_MS", "300"),
            ("FAILED_EVENTS_BACKOFF_CAP_MS", "5000"),
            ("FAILED_EVENTS_MAX_ATTEMPTS", "5"),
            ("FAILED_EVENTS_AUTO_RETRY", "off"),
        ])
        .unwrap();

        assert_eq!(
            cfg.backoff,
            BackoffConfig::Linear {
                base_ms: 200,
                increment_ms: 300,
                cap_ms: 5_000
            }
        );
        assert_eq!(cfg.max_attempts, 5);
        assert!(!cfg.auto_retry);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = from_pairs(&[("FAILED_EVENTS_BATCH_SIZE", "lots")]).unwrap_err();
        assert!(err.to_string().contains("FAILED_EVENTS_BATCH_SIZE"));

        assert!(from_pairs(&[("FAILED_EVENTS_MAX_ATTEMPTS", "0")]).is_err());
        assert!(from_pairs(&[("FAILED_EVENTS_BACKOFF", "random")]).is_err());
        assert!(
            from_pairs(&[
                ("FAILED_EVENTS_BACKOFF_BASE_MS", "10000"),
                ("FAILED_EVENTS_BACKOFF_CAP_MS", "100"),
            ])
            .is_err()
        );
    }

    #[test]
    fn orchestrator_uses_configured_policy() {
        let cfg = from_pairs(&[
            ("FAILED_EVENTS_BACKOFF", "fixed"),
            ("FAILED_EVENTS_BACKOFF_BASE_MS", "250"),
            ("FAILED_EVENTS_BATCH_SIZE", "10"),
        ])
        .unwrap();
        let orch = cfg.orchestrator(InMemoryFailedEventStore::new()).unwrap();

        assert_eq!(orch.batch_size(), 10);
        assert_eq!(
            orch.policy_for("any").delay(7),
            Duration::from_millis(250)
        );
    }
}
