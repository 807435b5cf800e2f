//! Handle to a pending timed command
//!
//! Returned by `request` and passed to revert callbacks. Inside a callback
//! the handle is how the user keeps the entry alive: `reschedule` re-arms
//! after expiry or cancellation, `resume` picks the cancelled timer back up
//! with its remaining time.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use habkit_timer::Scheduler;
use tracing::warn;

use crate::{Resolution, TimedCommandEntry};

/// Handle to one target's pending timed command.
#[derive(Clone)]
pub struct TimedCommandHandle {
    entry: Arc<TimedCommandEntry>,
    scheduler: Arc<dyn Scheduler>,
}

impl fmt::Debug for TimedCommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedCommandHandle")
            .field("target", &self.entry.target)
            .finish_non_exhaustive()
    }
}

impl TimedCommandHandle {
    pub(crate) fn new(entry: Arc<TimedCommandEntry>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self { entry, scheduler }
    }

    #[cfg(test)]
    pub(crate) fn entry_weak(&self) -> std::sync::Weak<TimedCommandEntry> {
        Arc::downgrade(&self.entry)
    }

    /// The target this command was sent to.
    pub fn target(&self) -> &str {
        &self.entry.target
    }

    /// How the entry resolved, if it has. `Some` only while a revert
    /// callback for that resolution is running (or after teardown).
    pub fn resolution(&self) -> Option<Resolution> {
        self.entry.state.lock().unwrap().resolution
    }

    /// Move the revert to `duration` from now (`None` = the most recently
    /// requested duration).
    ///
    /// While pending this just moves the timer. From inside an expiry or
    /// cancellation callback it also clears the resolution, which keeps the
    /// entry alive instead of tearing it down.
    pub fn reschedule(&self, duration: Option<Duration>) {
        let mut st = self.entry.state.lock().unwrap();
        if st.torn_down {
            warn!(target = %self.entry.target, "reschedule() on a finished timed command; ignoring");
            return;
        }
        let duration = duration.unwrap_or(st.duration);
        match st.resolution {
            None => {
                if let Some(timer) = &st.timer {
                    timer.reschedule(duration);
                }
            }
            Some(Resolution::Expired) => {
                // Inside the expiry callback; the timer task is still alive
                // and re-arms in place.
                if let Some(timer) = &st.timer {
                    timer.reschedule(duration);
                }
                st.resolution = None;
            }
            Some(Resolution::Cancelled) => {
                // The old timer was cancelled; arm a fresh one.
                let Some(expire_cb) = st.expire_cb.clone() else {
                    return;
                };
                st.remaining = None;
                st.timer = Some(self.scheduler.schedule_after(duration, expire_cb));
                st.resolution = None;
            }
        }
    }

    /// Pick a cancelled timer back up with the time it had left.
    ///
    /// Only meaningful from inside a cancellation callback; anywhere else
    /// this is a logged no-op.
    pub fn resume(&self) {
        let mut st = self.entry.state.lock().unwrap();
        if st.resolution != Some(Resolution::Cancelled) || st.torn_down {
            warn!(target = %self.entry.target, "resume() outside a cancellation callback; ignoring");
            return;
        }
        let (remaining, expire_cb) = match (st.remaining.take(), st.expire_cb.clone()) {
            (Some(remaining), Some(expire_cb)) => (remaining, expire_cb),
            _ => {
                warn!(target = %self.entry.target, "resume() with no remaining time recorded; ignoring");
                return;
            }
        };
        st.timer = Some(self.scheduler.schedule_after(remaining, expire_cb));
        st.resolution = None;
    }
}
