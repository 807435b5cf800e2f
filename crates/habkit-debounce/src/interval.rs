//! Debounce interval and configuration types

use std::time::Duration;

use crate::{DebounceError, DebounceResult};

/// The spacing constraint for a debouncer.
///
/// A `Fixed` interval is a plain debounce floor. A `Range` additionally
/// imposes a hard ceiling: however long a burst keeps re-triggering, a fire
/// happens no later than `max` after the burst began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    Fixed(Duration),
    Range { min: Duration, max: Duration },
}

impl Interval {
    /// A fixed minimum-spacing interval.
    pub fn fixed(interval: Duration) -> DebounceResult<Self> {
        if interval.is_zero() {
            return Err(DebounceError::InvalidInterval);
        }
        Ok(Interval::Fixed(interval))
    }

    /// A min/max interval range.
    ///
    /// `min` is the debounce floor, `max` the ceiling measured from the
    /// start of the cycle. `min == max` coalesces a burst into a fire at a
    /// fixed delay from the burst's first call (throttling).
    pub fn range(min: Duration, max: Duration) -> DebounceResult<Self> {
        if min.is_zero() || max.is_zero() {
            return Err(DebounceError::InvalidInterval);
        }
        if min > max {
            return Err(DebounceError::InvalidRange { min, max });
        }
        Ok(Interval::Range { min, max })
    }

    /// The lower bound (the debounce floor).
    pub fn min(&self) -> Duration {
        match self {
            Interval::Fixed(d) => *d,
            Interval::Range { min, .. } => *min,
        }
    }

    /// The upper bound. Equals the lower bound for a fixed interval, which
    /// makes the ceiling rule a no-op there.
    pub fn max(&self) -> Duration {
        match self {
            Interval::Fixed(d) => *d,
            Interval::Range { max, .. } => *max,
        }
    }

    /// Whether this interval carries a distinct ceiling.
    pub fn is_range(&self) -> bool {
        matches!(self, Interval::Range { .. })
    }
}

/// Configuration for one [`Debouncer`](crate::Debouncer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Spacing constraint for fires.
    pub interval: Interval,
    /// Fire on the first call of a burst instead of after it goes quiet.
    pub leading: bool,
    /// Quiet time required before a call counts as a fresh burst.
    /// Defaults to the interval's lower bound.
    pub idle_time: Option<Duration>,
}

impl DebounceConfig {
    /// Trailing-edge config: fire once the burst goes quiet.
    pub fn trailing(interval: Interval) -> Self {
        Self {
            interval,
            leading: false,
            idle_time: None,
        }
    }

    /// Leading-edge config: fire on the first call of a burst.
    pub fn leading(interval: Interval) -> Self {
        Self {
            interval,
            leading: true,
            idle_time: None,
        }
    }

    /// Override the idle time. Rejects a zero duration.
    pub fn with_idle_time(mut self, idle_time: Duration) -> DebounceResult<Self> {
        if idle_time.is_zero() {
            return Err(DebounceError::InvalidInterval);
        }
        self.idle_time = Some(idle_time);
        Ok(self)
    }

    /// The idle time in effect: the explicit override, or the interval's
    /// lower bound.
    pub fn effective_idle_time(&self) -> Duration {
        self.idle_time.unwrap_or_else(|| self.interval.min())
    }
}
