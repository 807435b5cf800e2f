//! Cancellable, reschedulable single-shot timer handle
//!
//! A [`TimerHandle`] fronts one spawned timer task. The handle and the task
//! share a small mutex-guarded record of the timer's state and deadline; the
//! task sleeps until the deadline and re-reads the record whenever the handle
//! pokes it, so `cancel` and `reschedule` take effect without spawning a
//! second in-flight callback.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::trace;

use crate::TimerCallback;

/// Lifecycle of a scheduled timer.
///
/// Transitions are monotonic: `Scheduled` moves to `Cancelled` or `Executed`
/// and never back. The one documented exception is
/// [`TimerHandle::reschedule`] invoked from inside the firing callback, which
/// re-arms an `Executed` timer back to `Scheduled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Waiting for its deadline.
    Scheduled,
    /// Cancelled before firing; the callback will not run.
    Cancelled,
    /// The callback has begun (or finished) executing.
    Executed,
}

struct TimerRecord {
    state: TimerState,
    fire_at: Instant,
}

struct Shared {
    record: Mutex<TimerRecord>,
    /// Woken whenever the handle changes the record.
    rearmed: Notify,
}

/// Handle to one scheduled future callback.
///
/// Cheap to clone; all clones observe and drive the same timer.
///
/// Cancellation is best effort: a callback that has already started
/// executing runs to completion even if [`cancel`](Self::cancel) lands a
/// moment prior (in which case `cancel` returns `false`).
#[derive(Clone)]
pub struct TimerHandle {
    shared: Arc<Shared>,
}

impl TimerHandle {
    pub(crate) fn spawn(
        runtime: &tokio::runtime::Handle,
        fire_at: Instant,
        callback: TimerCallback,
    ) -> Self {
        let shared = Arc::new(Shared {
            record: Mutex::new(TimerRecord {
                state: TimerState::Scheduled,
                fire_at,
            }),
            rearmed: Notify::new(),
        });
        let task_shared = shared.clone();
        runtime.spawn(async move {
            run_timer(task_shared, callback).await;
        });
        Self { shared }
    }

    /// Current state of the timer.
    pub fn state(&self) -> TimerState {
        self.shared.record.lock().unwrap().state
    }

    /// The deadline, if still scheduled.
    pub fn fire_at(&self) -> Option<Instant> {
        let record = self.shared.record.lock().unwrap();
        match record.state {
            TimerState::Scheduled => Some(record.fire_at),
            TimerState::Cancelled | TimerState::Executed => None,
        }
    }

    /// Time left until the deadline, if still scheduled.
    pub fn remaining(&self) -> Option<Duration> {
        self.fire_at()
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Cancel the timer. Idempotent.
    ///
    /// Returns `false` if the timer has already fired or was already
    /// cancelled.
    pub fn cancel(&self) -> bool {
        let mut record = self.shared.record.lock().unwrap();
        match record.state {
            TimerState::Scheduled => {
                record.state = TimerState::Cancelled;
                drop(record);
                trace!("Timer cancelled");
                self.shared.rearmed.notify_one();
                true
            }
            TimerState::Cancelled | TimerState::Executed => false,
        }
    }

    /// Move the deadline to `delay` from now.
    ///
    /// Legal before the timer fires, or from inside the firing callback (in
    /// which case the timer re-arms and the callback will run again at the
    /// new deadline). Calling it on an `Executed` timer from anywhere other
    /// than its own callback is not meaningful: the timer task may already
    /// have exited, and the caller must schedule a fresh timer instead.
    ///
    /// Returns `false` on a cancelled timer.
    pub fn reschedule(&self, delay: Duration) -> bool {
        self.reschedule_at(Instant::now() + delay)
    }

    /// Move the deadline to an absolute instant. Same contract as
    /// [`reschedule`](Self::reschedule).
    pub fn reschedule_at(&self, fire_at: Instant) -> bool {
        let mut record = self.shared.record.lock().unwrap();
        match record.state {
            TimerState::Scheduled | TimerState::Executed => {
                record.fire_at = fire_at;
                record.state = TimerState::Scheduled;
                drop(record);
                trace!("Timer rescheduled");
                self.shared.rearmed.notify_one();
                true
            }
            TimerState::Cancelled => false,
        }
    }
}

async fn run_timer(shared: Arc<Shared>, callback: TimerCallback) {
    loop {
        let deadline = {
            let record = shared.record.lock().unwrap();
            match record.state {
                TimerState::Scheduled => record.fire_at,
                TimerState::Cancelled | TimerState::Executed => return,
            }
        };

        tokio::select! {
            _ = time::sleep_until(deadline) => {
                let fire = {
                    let mut record = shared.record.lock().unwrap();
                    match record.state {
                        TimerState::Scheduled if record.fire_at <= Instant::now() => {
                            record.state = TimerState::Executed;
                            true
                        }
                        // Deadline moved while we were sleeping.
                        TimerState::Scheduled => false,
                        TimerState::Cancelled | TimerState::Executed => return,
                    }
                };
                if fire {
                    callback();
                    // The callback may have re-armed us via `reschedule`.
                    let rearmed =
                        shared.record.lock().unwrap().state == TimerState::Scheduled;
                    if !rearmed {
                        return;
                    }
                }
            }
            _ = shared.rearmed.notified() => {}
        }
    }
}
