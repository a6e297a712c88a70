use chrono::{DateTime, NaiveDate, TimeDelta, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

pub const BUCKET_WIDTH_SECS: i64 = 3600;

/// Width of one bucket. Rollover, consolidation eligibility and purge
/// protection are all expressed in multiples of this.
pub fn bucket_width() -> TimeDelta {
    TimeDelta::seconds(BUCKET_WIDTH_SECS)
}

/// An hour-aligned UTC interval `[start, start + 1h)`.
///
/// Ordering follows `start`, so keys sort the same way time does, and the
/// canonical `YYYY-MM-DD-HH` identifier sorts lexicographically in that
/// order too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeBucket {
    start: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseBucketError(String);

impl fmt::Display for ParseBucketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid bucket identifier `{}`", self.0)
    }
}

impl std::error::Error for ParseBucketError {}

impl TimeBucket {
    /// The bucket that `ts` falls into.
    pub fn containing(ts: DateTime<Utc>) -> Self {
        let start = ts
            .with_nanosecond(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_minute(0))
            .unwrap_or(ts);
        Self { start }
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.start + bucket_width()
    }

    pub fn next(&self) -> Self {
        Self {
            start: self.start + bucket_width(),
        }
    }

    /// True once `now` has reached the end boundary, i.e. capture has moved
    /// on to a later bucket.
    pub fn is_complete(&self, now: DateTime<Utc>) -> bool {
        now >= self.end()
    }

    /// Time elapsed since the end boundary; zero while the bucket is open.
    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        (now - self.end()).max(TimeDelta::zero())
    }

    /// Time left until the end boundary; zero once complete.
    pub fn remaining(&self, now: DateTime<Utc>) -> TimeDelta {
        (self.end() - now).max(TimeDelta::zero())
    }

    pub fn id(&self) -> String {
        self.start.format("%Y-%m-%d-%H").to_string()
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

fn fixed_width_number(part: &str, width: usize) -> Option<u32> {
    if part.len() != width || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

impl FromStr for TimeBucket {
    type Err = ParseBucketError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let err = || ParseBucketError(raw.to_string());
        let mut parts = raw.split('-');
        let year = parts.next().and_then(|p| fixed_width_number(p, 4));
        let month = parts.next().and_then(|p| fixed_width_number(p, 2));
        let day = parts.next().and_then(|p| fixed_width_number(p, 2));
        let hour = parts.next().and_then(|p| fixed_width_number(p, 2));
        if parts.next().is_some() {
            return Err(err());
        }
        let (Some(year), Some(month), Some(day), Some(hour)) = (year, month, day, hour) else {
            return Err(err());
        };

        let start = NaiveDate::from_ymd_opt(year as i32, month, day)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .ok_or_else(err)?
            .and_utc();
        Ok(Self { start })
    }
}
