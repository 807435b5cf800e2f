//! Pluggable clock and delayed-callback primitives
//!
//! This crate provides the [`Scheduler`] trait, which is the only surface
//! through which the debounce and timed-command crates touch a real clock.
//! Everything else in the workspace asks a `Scheduler` for "now" and for
//! "run this callback later"; the scheduler decides what that means.
//!
//! The production implementation, [`TokioScheduler`], spawns one tokio task
//! per timer. Tests run the same implementation under tokio's paused clock
//! (`#[tokio::test(start_paused = true)]`), so no wall-clock sleeps are
//! needed anywhere in the workspace.

mod handle;

pub use handle::{TimerHandle, TimerState};

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

/// Timer errors
#[derive(Debug, Error)]
pub enum TimerError {
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

/// Result type for timer operations
pub type TimerResult<T> = Result<T, TimerError>;

/// A callback invoked when a timer fires.
///
/// Callbacks are `Fn` rather than `FnOnce` so that a timer rescheduled from
/// inside its own firing callback can invoke the same callback again.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// A source of "now" and of delayed callbacks.
///
/// Implementations must return a [`TimerHandle`] whose callback runs on a
/// worker distinct from the caller; `schedule_after` never blocks.
pub trait Scheduler: Send + Sync {
    /// The current instant, from whatever clock this scheduler uses.
    fn now(&self) -> Instant;

    /// Schedule `callback` to run once, `delay` from now.
    fn schedule_after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;
}

/// Production scheduler backed by the tokio time driver.
///
/// Each scheduled timer is one spawned task that sleeps until its deadline
/// and reacts to reschedule/cancel requests from its [`TimerHandle`].
#[derive(Debug)]
pub struct TokioScheduler {
    runtime: tokio::runtime::Handle,
}

impl TokioScheduler {
    /// Create a scheduler bound to the current tokio runtime.
    pub fn new() -> TimerResult<Self> {
        tokio::runtime::Handle::try_current()
            .map(|runtime| Self { runtime })
            .map_err(|e| TimerError::NoRuntime(e.to_string()))
    }

    /// Create a scheduler bound to an explicit runtime handle.
    pub fn with_runtime(runtime: tokio::runtime::Handle) -> Self {
        Self { runtime }
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule_after(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        trace!(?delay, "Scheduling timer");
        TimerHandle::spawn(&self.runtime, Instant::now() + delay, callback)
    }
}
