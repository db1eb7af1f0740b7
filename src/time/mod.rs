//! Time bucketing
//!
//! Floor/ceil timestamps to segment and query granularities, half-open
//! intervals, and the trailing window a reconciliation pass scans.

mod granularity;
mod interval;
mod window;

pub use granularity::{Buckets, Granularity};
pub use interval::Interval;
pub use window::RunWindow;
