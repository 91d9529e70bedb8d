//! Per-step retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, StepError};

/// How many times a step may be attempted and how long to wait in between.
///
/// Only transient failures are retried. `max_attempts` counts the first try,
/// so `max_attempts: 1` disables retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
        }
    }
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    None,
    Fixed {
        delay_ms: u64,
    },
    /// `initial_ms * multiplier^(attempt - 1)`, capped at `max_ms`.
    Exponential {
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial_ms: 500,
            multiplier: 2.0,
            max_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
        }
    }

    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay_ms },
        }
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let ms = match &self.backoff {
            Backoff::None => 0,
            Backoff::Fixed { delay_ms } => *delay_ms,
            Backoff::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let base = *initial_ms as f64 * multiplier.powi(exponent);
                base.min(*max_ms as f64) as u64
            }
        };
        Duration::from_millis(ms)
    }

    /// Like [`delay_after`](Self::delay_after), but honours a provider's
    /// retry-after hint when it asks for longer.
    pub fn delay_for_error(&self, attempt: u32, error: &StepError) -> Duration {
        let computed = self.delay_after(attempt);
        match error {
            StepError::Agent(AgentError::RateLimited {
                retry_after_secs: Some(secs),
                ..
            }) => computed.max(Duration::from_secs(*secs)),
            _ => computed,
        }
    }

    /// Structural sanity check used at publish time.
    pub fn check(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        if let Backoff::Exponential {
            initial_ms,
            multiplier,
            max_ms,
        } = &self.backoff
        {
            if !multiplier.is_finite() || *multiplier < 1.0 {
                return Err(format!("multiplier must be >= 1.0, got {multiplier}"));
            }
            if max_ms < initial_ms {
                return Err(format!("max_ms ({max_ms}) is below initial_ms ({initial_ms})"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_schedule_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            backoff: Backoff::Exponential {
                initial_ms: 100,
                multiplier: 2.0,
                max_ms: 500,
            },
        };
        let delays: Vec<u64> = (1..=5)
            .map(|a| policy.delay_after(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_allows_retry_counts_first_attempt() {
        let policy = RetryPolicy::fixed(3, 10);
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
        assert!(!RetryPolicy::no_retry().allows_retry(1));
    }

    #[test]
    fn test_rate_limit_hint_extends_delay() {
        let policy = RetryPolicy::fixed(3, 10);
        let err = StepError::Agent(AgentError::RateLimited {
            provider: "p".into(),
            retry_after_secs: Some(2),
        });
        assert_eq!(policy.delay_for_error(1, &err), Duration::from_secs(2));
    }

    #[test]
    fn test_check_rejects_zero_attempts_and_shrinking_backoff() {
        let zero = RetryPolicy {
            max_attempts: 0,
            backoff: Backoff::None,
        };
        assert!(zero.check().is_err());

        let shrinking = RetryPolicy {
            max_attempts: 2,
            backoff: Backoff::Exponential {
                initial_ms: 100,
                multiplier: 0.5,
                max_ms: 1000,
            },
        };
        assert!(shrinking.check().is_err());
        assert!(RetryPolicy::default().check().is_ok());
    }

    #[test]
    fn test_yaml_shape() {
        let policy: RetryPolicy =
            serde_yaml::from_str("max_attempts: 4\nbackoff:\n  strategy: fixed\n  delay_ms: 250\n")
                .unwrap();
        assert_eq!(policy, RetryPolicy::fixed(4, 250));
    }
}
