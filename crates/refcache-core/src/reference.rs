//! Reference metadata
//!
//! A [`Reference`] names an external dataset, says how to fetch it and how
//! often, and points at the version of its artifact readers should see.

use chrono::{DateTime, Utc};
use refcache_artifact::{ArtifactKind, VersionId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Source type used when a descriptor has no `type` field
pub const DEFAULT_SOURCE_TYPE: &str = "http";

/// Refresh state of a reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefStatus {
    /// Last refresh succeeded
    Fresh,
    /// Never refreshed, or due for a refresh
    Stale,
    /// A refresh job is queued or running
    Refreshing,
    /// Last refresh failed; any previous artifact is still served
    Failed,
}

/// Failure category recorded in [`ErrorInfo`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Storage,
    NotFound,
    Cancelled,
}

/// Last failure of a reference's refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

impl ErrorInfo {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>, attempts: u32, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            message: message.into(),
            attempts,
            at,
        }
    }
}

/// A named external dataset and its refresh bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub name: String,
    pub kind: ArtifactKind,
    /// Opaque fetch configuration, interpreted by the matching fetcher
    pub source_descriptor: serde_json::Value,
    pub current_version: Option<VersionId>,
    pub status: RefStatus,
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorInfo>,
    #[serde(with = "interval")]
    pub refresh_interval: Duration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reference {
    /// A never-refreshed reference
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        kind: ArtifactKind,
        source_descriptor: serde_json::Value,
        refresh_interval: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            source_descriptor,
            current_version: None,
            status: RefStatus::Stale,
            last_success_at: None,
            last_attempt_at: None,
            last_error: None,
            refresh_interval,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fetcher key from the descriptor's `type` field
    #[must_use]
    pub fn source_type(&self) -> &str {
        self.source_descriptor
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(DEFAULT_SOURCE_TYPE)
    }

    #[inline]
    #[must_use]
    pub fn has_artifact(&self) -> bool {
        self.current_version.is_some()
    }

    /// Should the timer start a refresh at `now`?
    ///
    /// Failed references wait `failed_retry_interval` since their last
    /// attempt instead of their regular interval.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>, failed_retry_interval: Duration) -> bool {
        match self.status {
            RefStatus::Refreshing => false,
            RefStatus::Failed => self
                .last_attempt_at
                .map_or(true, |at| elapsed(at, now) >= failed_retry_interval),
            RefStatus::Fresh | RefStatus::Stale => self
                .last_success_at
                .map_or(true, |at| elapsed(at, now) >= self.refresh_interval),
        }
    }

    /// Served data is older than one refresh interval
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.last_success_at
            .map_or(true, |at| elapsed(at, now) > self.refresh_interval)
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    // Clock going backwards counts as no time passed
    (now - since).to_std().unwrap_or_default()
}

/// Parse `"90"`, `"90s"`, `"15m"`, `"1h"` or `"1d"` into a duration
///
/// # Errors
/// Returns a description of the problem for empty, zero, or malformed input
pub fn parse_interval(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid interval {input:?}"))?;
    let secs = match unit.trim() {
        "" | "s" => value,
        "m" => value.saturating_mul(60),
        "h" => value.saturating_mul(3600),
        "d" => value.saturating_mul(86_400),
        other => return Err(format!("unknown interval unit {other:?} in {input:?}")),
    };
    if secs == 0 {
        return Err(format!("interval must be positive: {input:?}"));
    }
    Ok(Duration::from_secs(secs))
}

/// Serde for refresh intervals: written as whole seconds, read from seconds
/// or a unit-suffixed string
pub mod interval {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        struct IntervalVisitor;

        impl Visitor<'_> for IntervalVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("seconds as an integer, or a string like \"3600s\" or \"1h\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                if v == 0 {
                    return Err(E::custom("interval must be positive"));
                }
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                let v = u64::try_from(v).map_err(|_| E::custom("interval must be positive"))?;
                self.visit_u64(v)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                super::parse_interval(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(IntervalVisitor)
    }
}
