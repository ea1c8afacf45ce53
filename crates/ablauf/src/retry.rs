//! Retry policies and the step result-size budget

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::units::{parse_duration, parse_size, UnitParseError};

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Always wait the base delay.
    Fixed,
    /// Wait `delay * attempt`.
    Linear,
    /// Wait `delay * 2^(attempt - 1)`.
    Exponential,
}

impl Backoff {
    /// Delay before the next attempt, given the number of failures so far
    /// (1-based).
    pub fn delay_for(&self, delay: Duration, attempt: u32) -> Duration {
        let base = delay.as_millis() as u64;
        let attempt = attempt.max(1);
        let millis = match self {
            Self::Fixed => base,
            Self::Linear => base.saturating_mul(u64::from(attempt)),
            Self::Exponential => {
                let exponent = u64::from(attempt - 1).min(62);
                base.saturating_mul(1u64 << exponent)
            }
        };
        Duration::from_millis(millis)
    }
}

/// Retry configuration for `run` steps.
///
/// # Example
///
/// ```
/// use ablauf::retry::{Backoff, RetryPolicy};
///
/// let policy = RetryPolicy::new(5, "500ms", Backoff::Exponential).unwrap();
/// assert_eq!(policy.delay_for_attempt(1).as_millis(), 500);
/// assert_eq!(policy.delay_for_attempt(3).as_millis(), 2000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one).
    pub limit: u32,

    /// Base delay before the first retry.
    #[serde(with = "duration_millis")]
    pub delay: Duration,

    /// Backoff strategy.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 3,
            delay: Duration::from_secs(1),
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy from a duration string (`"500ms"`, `"30s"`, ...).
    pub fn new(limit: u32, delay: &str, backoff: Backoff) -> Result<Self, UnitParseError> {
        Ok(Self {
            limit,
            delay: Duration::from_millis(parse_duration(delay)? as u64),
            backoff,
        })
    }

    /// Delay before the next attempt, given the number of failures so far
    /// (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for(self.delay, attempt)
    }

    /// Merge a per-call override; overridden fields win field-by-field.
    pub fn merge(&self, overrides: &RetryOverride) -> Self {
        Self {
            limit: overrides.limit.unwrap_or(self.limit),
            delay: overrides.delay.unwrap_or(self.delay),
            backoff: overrides.backoff.unwrap_or(self.backoff),
        }
    }
}

/// Per-call retry override for a single `run` step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryOverride {
    pub limit: Option<u32>,
    pub delay: Option<Duration>,
    pub backoff: Option<Backoff>,
}

impl RetryOverride {
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn delay(mut self, delay: &str) -> Result<Self, UnitParseError> {
        self.delay = Some(Duration::from_millis(parse_duration(delay)? as u64));
        Ok(self)
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// What to do when a `run` step result would exceed the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail the step immediately, without retrying.
    Fail,
    /// Treat the overflow as a normal, retriable failure.
    Retry,
}

/// Budget for the running sum of encoded `run` step results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSizeLimit {
    /// Maximum total encoded size in bytes.
    pub max_size: u64,

    /// Overflow policy.
    pub on_overflow: OverflowPolicy,
}

impl Default for ResultSizeLimit {
    fn default() -> Self {
        Self {
            max_size: 64 << 20,
            on_overflow: OverflowPolicy::Fail,
        }
    }
}

impl ResultSizeLimit {
    /// Create a limit from a size string (`"64mb"`, `"1kb"`, ...).
    pub fn new(max_size: &str, on_overflow: OverflowPolicy) -> Result<Self, UnitParseError> {
        Ok(Self {
            max_size: parse_size(max_size)?,
            on_overflow,
        })
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
