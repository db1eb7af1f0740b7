//! Granularity definitions and bucket arithmetic

use super::Interval;
use crate::{Error, Result};

use chrono::{DateTime, Datelike, Duration, Months, NaiveTime, Utc};
use serde::{Serialize, Serializer};

const SECONDS_PER_DAY: i64 = 86_400;
const SECONDS_PER_WEEK: i64 = 7 * SECONDS_PER_DAY;
/// 1970-01-01 is a Thursday; weeks start on Monday, three days earlier.
const WEEK_EPOCH_SHIFT: i64 = 3 * SECONDS_PER_DAY;

/// Time granularity used for segment boundaries and query rollup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    Minute,
    FifteenMinute,
    ThirtyMinute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Granularity {
    /// Granularities accepted as `segmentGranularity`
    pub const SEGMENT: &'static [Granularity] = &[
        Granularity::FifteenMinute,
        Granularity::ThirtyMinute,
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
        Granularity::Year,
    ];

    /// Granularities accepted as `queryGranularity`
    pub const QUERY: &'static [Granularity] = &[
        Granularity::Minute,
        Granularity::FifteenMinute,
        Granularity::ThirtyMinute,
        Granularity::Hour,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::FifteenMinute => "fifteen_minute",
            Self::ThirtyMinute => "thirty_minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    /// Parse a granularity that must be valid as a segment granularity
    pub fn parse_segment(raw: &str) -> Result<Self> {
        Self::parse_restricted(raw, Self::SEGMENT)
    }

    /// Parse a granularity that must be valid as a query granularity
    pub fn parse_query(raw: &str) -> Result<Self> {
        Self::parse_restricted(raw, Self::QUERY)
    }

    fn parse_restricted(raw: &str, allowed: &[Granularity]) -> Result<Self> {
        let granularity: Granularity = raw.parse()?;
        if allowed.contains(&granularity) {
            Ok(granularity)
        } else {
            Err(Error::UnsupportedGranularity(raw.to_string()))
        }
    }

    /// Fixed bucket width in seconds, for the calendar-independent granularities
    fn fixed_seconds(&self) -> Option<i64> {
        match self {
            Self::Minute => Some(60),
            Self::FifteenMinute => Some(15 * 60),
            Self::ThirtyMinute => Some(30 * 60),
            Self::Hour => Some(3600),
            Self::Day => Some(SECONDS_PER_DAY),
            Self::Week | Self::Month | Self::Year => None,
        }
    }

    /// Start of the bucket containing `t`
    pub fn floor(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let secs = t.timestamp();
        let floored = match self {
            Self::Week => {
                (secs + WEEK_EPOCH_SHIFT).div_euclid(SECONDS_PER_WEEK) * SECONDS_PER_WEEK
                    - WEEK_EPOCH_SHIFT
            }
            Self::Month => {
                let date = t.date_naive();
                let first = date.with_day(1).unwrap_or(date);
                return first.and_time(NaiveTime::default()).and_utc();
            }
            Self::Year => {
                let date = t.date_naive();
                let first = date.with_ordinal(1).unwrap_or(date);
                return first.and_time(NaiveTime::default()).and_utc();
            }
            fixed => {
                let step = fixed.fixed_seconds().unwrap_or(1);
                secs.div_euclid(step) * step
            }
        };
        DateTime::from_timestamp(floored, 0).unwrap_or(t)
    }

    /// Smallest bucket boundary at or after `t`
    pub fn ceil(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let floored = self.floor(t);
        if floored == t {
            t
        } else {
            self.next(floored)
        }
    }

    /// Boundary one bucket after the aligned instant `t`
    pub fn next(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Week => t + Duration::seconds(SECONDS_PER_WEEK),
            Self::Month => t
                .checked_add_months(Months::new(1))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Self::Year => t
                .checked_add_months(Months::new(12))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            fixed => t + Duration::seconds(fixed.fixed_seconds().unwrap_or(1)),
        }
    }

    /// The bucket `[floor(t), next(floor(t)))` containing `t`
    pub fn bucket(&self, t: DateTime<Utc>) -> Interval {
        let start = self.floor(t);
        Interval::from_bounds(start, self.next(start))
    }

    /// Enumerate buckets whose start lies in `[floor(start), floor(end))`
    pub fn buckets(&self, interval: &Interval) -> Buckets {
        Buckets {
            granularity: *self,
            cursor: self.floor(interval.start()),
            end: self.floor(interval.end()),
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Granularity {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "minute" => Ok(Self::Minute),
            "fifteen_minute" => Ok(Self::FifteenMinute),
            "thirty_minute" => Ok(Self::ThirtyMinute),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            _ => Err(Error::UnsupportedGranularity(value.to_string())),
        }
    }
}

impl Serialize for Granularity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Iterator over consecutive buckets of one granularity
#[derive(Debug, Clone)]
pub struct Buckets {
    granularity: Granularity,
    cursor: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Iterator for Buckets {
    type Item = Interval;

    fn next(&mut self) -> Option<Interval> {
        if self.cursor >= self.end {
            return None;
        }
        let start = self.cursor;
        let next = self.granularity.next(start);
        self.cursor = next;
        Some(Interval::from_bounds(start, next))
    }
}
