// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Time types.

use std::{
    fmt,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Unix timestamp in milliseconds.
// i64 so timestamps before 1970-01-01 remain representable.
#[derive(
    Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const MAX: Timestamp = Timestamp(i64::MAX);
    pub const MIN: Timestamp = Timestamp(i64::MIN);
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn new(ms: i64) -> Self {
        Self(ms)
    }

    /// Current (non-negative) unix timestamp in millis.
    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| Timestamp(d.as_millis().min(i64::MAX as u128) as i64))
            .unwrap_or(Timestamp::ZERO)
    }

    #[inline]
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// `self - duration`, saturating to [Timestamp::MIN] on underflow.
    #[must_use]
    pub fn sub_duration_or_min(&self, duration: Duration) -> Self {
        let ms = duration.as_millis().min(i64::MAX as u128) as i64;
        Timestamp(self.0.saturating_sub(ms))
    }

    /// `self + duration`, saturating to [Timestamp::MAX] on overflow.
    #[must_use]
    pub fn add_duration_or_max(&self, duration: Duration) -> Self {
        let ms = duration.as_millis().min(i64::MAX as u128) as i64;
        Timestamp(self.0.saturating_add(ms))
    }

    /// Millis elapsed from `earlier` to `self`, zero if `earlier` is newer.
    pub fn millis_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0).max(0) as u64
    }
}

impl From<i64> for Timestamp {
    fn from(ms: i64) -> Self {
        Self(ms)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half open time range [start, end) in millis resolution.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    start: Timestamp,
    end: Timestamp,
}

impl TimeRange {
    /// Create a range, `None` if `start > end`.
    pub fn new(start: Timestamp, end: Timestamp) -> Option<Self> {
        if start <= end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Create a range without bound check, panic if `start > end`.
    pub fn new_unchecked(start: Timestamp, end: Timestamp) -> Self {
        assert!(start <= end, "invalid time range [{start}, {end})");
        Self { start, end }
    }

    pub const fn min_to_max() -> Self {
        Self {
            start: Timestamp::MIN,
            end: Timestamp::MAX,
        }
    }

    #[inline]
    pub fn start(&self) -> Timestamp {
        self.start
    }

    #[inline]
    pub fn end(&self) -> Timestamp {
        self.end
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            Some(TimeRange { start, end })
        } else {
            None
        }
    }

    /// Subtract every range in `others` from `self`, returning the sub-ranges
    /// of `self` that remain, in order.
    pub fn subtract_all(&self, others: &[TimeRange]) -> Vec<TimeRange> {
        let mut covering: Vec<TimeRange> = others
            .iter()
            .filter_map(|r| self.intersect(r))
            .collect();
        covering.sort_by_key(|r| r.start);

        let mut remaining = Vec::new();
        let mut cursor = self.start;
        for r in covering {
            if r.start > cursor {
                remaining.push(TimeRange {
                    start: cursor,
                    end: r.start,
                });
            }
            cursor = cursor.max(r.end);
        }
        if cursor < self.end {
            remaining.push(TimeRange {
                start: cursor,
                end: self.end,
            });
        }

        remaining
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Source of wall clock time, injectable so retention and sweeping are
/// testable without sleeping through the delete delay.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

pub type ClockRef = Arc<dyn Clock>;

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Clock driven by tests.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now_ms: AtomicI64::new(now.as_i64()),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now_ms.store(now.as_i64(), Ordering::Relaxed);
    }

    pub fn advance(&self, duration: Duration) {
        self.now_ms
            .fetch_add(duration.as_millis() as i64, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.now_ms.load(Ordering::Relaxed))
    }
}
