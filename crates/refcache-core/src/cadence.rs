//! When the scheduler wakes up to look for due references

use crate::reference::interval;
use chrono::{DateTime, Duration as TimeDelta, Offset, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shortest sleep between two ticks
pub const MIN_TICK_DELAY: Duration = Duration::from_secs(1);

/// Tick schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Cadence {
    /// Tick every `every`, starting immediately
    Interval {
        #[serde(with = "interval")]
        every: Duration,
    },
    /// Tick at `minute` past every hour of `timezone`, e.g. HH:02
    Hourly {
        minute: u32,
        /// IANA zone name; UTC when omitted
        #[serde(default = "utc")]
        timezone: Tz,
    },
}

fn utc() -> Tz {
    Tz::UTC
}

impl Default for Cadence {
    fn default() -> Self {
        Self::Interval {
            every: Duration::from_secs(60),
        }
    }
}

impl Cadence {
    /// Hourly ticks on UTC wall-clock time
    #[must_use]
    pub const fn hourly(minute: u32) -> Self {
        Self::Hourly {
            minute,
            timezone: Tz::UTC,
        }
    }

    /// First tick strictly after `now`
    #[must_use]
    pub fn next_tick(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Self::Interval { every } => now + TimeDelta::from_std(every).unwrap_or(TimeDelta::seconds(60)),
            Self::Hourly { minute, timezone } => next_hourly_tick(now, minute, timezone),
        }
    }

    /// How long to sleep from `now` until the next tick
    #[must_use]
    pub fn delay_until_next(&self, now: DateTime<Utc>) -> Duration {
        (self.next_tick(now) - now)
            .to_std()
            .unwrap_or(MIN_TICK_DELAY)
            .max(MIN_TICK_DELAY)
    }
}

/// Next `HH:minute:00` in `timezone`, strictly after `now`
///
/// The zone's offset at `now` shifts the minute boundary, so half- and
/// quarter-hour zones tick on their own wall clock.
#[must_use]
pub fn next_hourly_tick(now: DateTime<Utc>, minute: u32, timezone: Tz) -> DateTime<Utc> {
    let offset = TimeDelta::seconds(i64::from(
        timezone.offset_from_utc_datetime(&now.naive_utc()).fix().local_minus_utc(),
    ));
    next_utc_hourly_tick(now + offset, minute) - offset
}

fn next_utc_hourly_tick(now: DateTime<Utc>, minute: u32) -> DateTime<Utc> {
    let minute = minute.min(59);
    let this_hour = now
        .date_naive()
        .and_hms_opt(now.hour(), minute, 0)
        .map(|naive| Utc.from_utc_datetime(&naive));
    match this_hour {
        Some(tick) if tick > now => tick,
        Some(tick) => tick + TimeDelta::hours(1),
        None => now + TimeDelta::hours(1),
    }
}
