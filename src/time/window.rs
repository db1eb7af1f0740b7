//! Trailing scan window relative to the wall clock

use super::{Granularity, Interval};

use chrono::{DateTime, Duration, Utc};

/// A trailing window of `window` hours that stops `offset` hours before now.
///
/// The start is floored to the day so consecutive runs scan stable
/// boundaries; the end is floored to the hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunWindow {
    pub window_hours: u32,
    pub offset_hours: u32,
}

impl RunWindow {
    pub fn new(window_hours: u32, offset_hours: u32) -> Self {
        Self {
            window_hours,
            offset_hours,
        }
    }

    /// Resolve the window against `now`
    pub fn resolve(&self, now: DateTime<Utc>) -> Interval {
        let lookback = Duration::hours(i64::from(self.window_hours) + i64::from(self.offset_hours));
        let start = Granularity::Day.floor(now - lookback);
        let end = Granularity::Hour.floor(now - Duration::hours(i64::from(self.offset_hours)));
        Interval::from_bounds(start, end)
    }

    /// Resolve the window against the current wall clock
    pub fn resolve_now(&self) -> Interval {
        self.resolve(Utc::now())
    }
}

impl Default for RunWindow {
    fn default() -> Self {
        Self::new(24, 3)
    }
}
