//! Run configuration.

use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

/// Retry items that failed this many times are dead-lettered.
pub const MAX_RETRY_COUNT: i32 = 5;

/// Items claimed by one retry drain.
pub const DEFAULT_DRAIN_BATCH_SIZE: i64 = 50;

/// Korean Standard Time, where the program's weeks begin.
pub const DEFAULT_WEEK_OFFSET_HOURS: i32 = 9;

/// Settings shared by every batch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_retry_count: i32,
    pub drain_batch_size: i64,
    /// UTC offset (hours) used to decide which week is current.
    pub week_offset_hours: i32,
    pub pacing: Pacing,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_retry_count: MAX_RETRY_COUNT,
            drain_batch_size: DEFAULT_DRAIN_BATCH_SIZE,
            week_offset_hours: DEFAULT_WEEK_OFFSET_HOURS,
            pacing: Pacing::default(),
        }
    }
}

impl RunConfig {
    /// Defaults with all lookup delays disabled.
    pub fn without_pacing() -> Self {
        Self {
            pacing: Pacing::none(),
            ..Self::default()
        }
    }

    pub fn week_offset(&self) -> FixedOffset {
        self.week_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix())
    }
}

/// Randomized delay window, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const fn millis(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub const ZERO: DelayRange = DelayRange::millis(0, 0);

    /// A uniformly random duration inside the window.
    pub fn pick(&self) -> Duration {
        let (lo, hi) = if self.min_ms <= self.max_ms {
            (self.min_ms, self.max_ms)
        } else {
            (self.max_ms, self.min_ms)
        };
        Duration::from_millis(fastrand::u64(lo..=hi))
    }

    pub fn is_zero(&self) -> bool {
        self.min_ms == 0 && self.max_ms == 0
    }
}

/// Delays inserted after each lookup, keyed by outcome.
///
/// The platform's abuse detection watches per-account request rate, so
/// successful lookups wait longest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pacing {
    pub after_success: DelayRange,
    pub after_skip: DelayRange,
    pub after_retryable: DelayRange,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            after_success: DelayRange::millis(5_000, 10_000),
            after_skip: DelayRange::millis(1_000, 2_000),
            after_retryable: DelayRange::millis(5_000, 10_000),
        }
    }
}

impl Pacing {
    pub fn none() -> Self {
        Self {
            after_success: DelayRange::ZERO,
            after_skip: DelayRange::ZERO,
            after_retryable: DelayRange::ZERO,
        }
    }
}
