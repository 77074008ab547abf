use std::collections::BTreeSet;
use std::time::Duration;

use crate::{QaError, Result};

/// Statuses retried when nothing else is configured.
pub const DEFAULT_RETRY_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Target service location and per-call timeout.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceOptions {
    /// Base URL every request path is joined onto.
    pub base_url: String,
    /// Hard timeout applied to each individual attempt.
    pub timeout: Duration,
}

impl ServiceOptions {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
        }
    }
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            base_url: "https://httpbin.org".to_owned(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Configures the attempt budget and exponential backoff.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of tries, including the first one.
    pub attempts: u32,
    /// Delay inserted after the first failed attempt.
    pub backoff: Duration,
    /// Factor applied to the delay after every further failed attempt.
    pub multiplier: f64,
    /// Response statuses that are retried instead of returned.
    pub retry_on_statuses: BTreeSet<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(400),
            multiplier: 2.0,
            retry_on_statuses: DEFAULT_RETRY_STATUSES.into_iter().collect(),
        }
    }
}

impl RetryConfig {
    /// Single attempt, nothing is ever retried.
    pub fn no_retry() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration, multiplier: f64) -> Self {
        self.backoff = backoff;
        self.multiplier = multiplier;
        self
    }

    pub fn with_statuses<I: IntoIterator<Item = u16>>(mut self, statuses: I) -> Self {
        self.retry_on_statuses = statuses.into_iter().collect();
        self
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_on_statuses.contains(&status)
    }

    /// Delay to wait after attempt `attempt` (1-based) before the next one:
    /// `backoff * multiplier^(attempt - 1)`.
    ///
    /// Saturates to [`Duration::MAX`] instead of overflowing. A zero backoff
    /// stays zero for every attempt.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        if self.backoff.is_zero() {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.backoff.as_secs_f64() * self.multiplier.powi(exp);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Checks the invariants every retry loop relies on.
    pub fn validate(&self) -> Result<()> {
        if self.attempts < 1 {
            return Err(QaError::Config("retry attempts must be >= 1".to_owned()));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(QaError::Config(format!(
                "retry backoff multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}
