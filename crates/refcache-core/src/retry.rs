//! Retry policy for upstream fetches
//!
//! [`RetryPolicy::decide`] is pure: given how many attempts have been made,
//! what kind of error the last one hit, and a jitter sample in `[0, 1)`, it
//! says whether to try again and after how long.

use crate::reference::ErrorKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Exponential backoff with jitter, applied to transient failures only
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay randomized in either direction, `0.0..=1.0`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Never retry
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        self.max_delay_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Decide the follow-up to failed attempt number `attempt` (1-based)
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn decide(&self, attempt: u32, kind: ErrorKind, jitter_sample: f64) -> RetryDecision {
        if kind != ErrorKind::Transient || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        let cap = self.max_delay_ms as f64;
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let backoff = (self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent)).min(cap);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let sample = jitter_sample.clamp(0.0, 1.0);
        let factor = 1.0 - jitter + 2.0 * jitter * sample;
        let delay_ms = (backoff * factor).min(cap).max(0.0);

        RetryDecision::RetryAfter(Duration::from_millis(delay_ms as u64))
    }

    /// [`Self::decide`] with a random jitter sample
    #[must_use]
    pub fn next(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        self.decide(attempt, kind, rand::random::<f64>())
    }
}
