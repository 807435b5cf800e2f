//! Reentrant command-then-revert timers for automation targets
//!
//! A timed command sends a command to a target (turn the porch light on)
//! and reverts it after a duration, unless something else touches the
//! target first. The three rules that make this useful in a scripting layer:
//!
//! - **Reentrant**: a second request for the same target reschedules the
//!   existing timer in place instead of stacking a second revert.
//! - **Interruptible**: an externally observed change to the target cancels
//!   the pending revert (the user clearly wants the new state kept). The
//!   entry's own command is applied with the interrupt listener transiently
//!   suppressed so it cannot cancel itself.
//! - **Resumable**: expiry and cancellation run an optional user callback
//!   that may call [`TimedCommandHandle::reschedule`] or
//!   [`TimedCommandHandle::resume`] to keep the entry alive instead of
//!   tearing it down.
//!
//! Per-target state lives behind each entry's own mutex, which serializes
//! the race between "timer about to fire" and "interrupt about to fire".

mod handle;

pub use handle::TimedCommandHandle;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use habkit_timer::{Scheduler, TimerCallback, TimerHandle};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Timed command errors
#[derive(Debug, Error)]
pub enum TimedCommandError {
    #[error("timed command duration must be greater than zero")]
    ZeroDuration,

    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

/// Result type for timed command operations
pub type TimedCommandResult<T> = Result<T, TimedCommandError>;

/// How commands reach their targets. Supplied by the host runtime.
pub trait CommandSink: Send + Sync {
    fn send(&self, target: &str, command: &Value);
}

/// An externally observed state change on a target.
#[derive(Debug, Clone)]
pub struct TargetEvent {
    pub target: String,
}

/// A user callback run on expiry or interruption, with a handle it can use
/// to keep the entry alive.
pub type RevertCallback = Arc<dyn Fn(&TimedCommandHandle) + Send + Sync>;

/// What to do when a timed command expires.
#[derive(Clone)]
pub enum RevertAction {
    /// Send this command back to the target.
    Fixed(Value),
    /// Run a user callback. Also invoked on interruption, with
    /// `resolution() == Some(Cancelled)`.
    Callback(RevertCallback),
}

impl fmt::Debug for RevertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevertAction::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            RevertAction::Callback(_) => f.debug_tuple("Callback").field(&"..").finish(),
        }
    }
}

/// How a pending entry resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The timer fired.
    Expired,
    /// An external change interrupted it.
    Cancelled,
}

pub(crate) struct TimedCommandEntry {
    pub(crate) target: String,
    pub(crate) state: Mutex<EntryState>,
}

pub(crate) struct EntryState {
    pub(crate) resolution: Option<Resolution>,
    pub(crate) timer: Option<TimerHandle>,
    pub(crate) revert: RevertAction,
    /// Most recently requested duration; default for `reschedule(None)`.
    pub(crate) duration: Duration,
    /// Time left on the timer at cancellation; consumed by `resume`.
    pub(crate) remaining: Option<Duration>,
    /// Interrupt listener transiently disabled while this entry's own
    /// command or revert is being applied.
    pub(crate) suppressed: bool,
    pub(crate) listener: Option<tokio::task::JoinHandle<()>>,
    /// The expiry body, kept so `resume`/`reschedule` can arm a fresh timer
    /// after cancellation.
    pub(crate) expire_cb: Option<TimerCallback>,
    /// Set once the entry has been removed; a handle or late request must
    /// not revive it.
    pub(crate) torn_down: bool,
}

type EntryMap = Arc<DashMap<String, Arc<TimedCommandEntry>>>;

/// Per-target table of timed commands.
pub struct TimedCommandManager {
    scheduler: Arc<dyn Scheduler>,
    sink: Arc<dyn CommandSink>,
    events: broadcast::Sender<TargetEvent>,
    entries: EntryMap,
    runtime: tokio::runtime::Handle,
}

impl TimedCommandManager {
    /// Create a manager bound to the current tokio runtime.
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        sink: Arc<dyn CommandSink>,
    ) -> TimedCommandResult<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TimedCommandError::NoRuntime(e.to_string()))?;
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Ok(Self {
            scheduler,
            sink,
            events,
            entries: Arc::new(DashMap::new()),
            runtime,
        })
    }

    /// Report an externally observed state change on `target`.
    ///
    /// The host calls this from wherever it watches target state. Changes
    /// caused by a pending entry's own command are filtered out by the
    /// entry's suppression window, not here.
    pub fn notify_external(&self, target: &str) {
        let _ = self.events.send(TargetEvent {
            target: target.to_string(),
        });
    }

    /// Send `command` to `target` and revert after `duration`.
    ///
    /// If the target already has a pending entry, its timer is rescheduled
    /// to the new duration and its revert action replaced; no second entry
    /// is created.
    pub fn request(
        &self,
        target: &str,
        command: Value,
        duration: Duration,
        revert: RevertAction,
    ) -> TimedCommandResult<TimedCommandHandle> {
        if duration.is_zero() {
            return Err(TimedCommandError::ZeroDuration);
        }
        loop {
            match self.entries.entry(target.to_string()) {
                MapEntry::Occupied(occupied) => {
                    let entry = occupied.get().clone();
                    drop(occupied);
                    {
                        let mut st = entry.state.lock().unwrap();
                        if st.torn_down {
                            // Raced with a teardown; retry with a fresh entry.
                            drop(st);
                            self.entries
                                .remove_if(target, |_, e| Arc::ptr_eq(e, &entry));
                            continue;
                        }
                        debug!(target, ?duration, "Rescheduling pending timed command");
                        st.revert = revert;
                        st.duration = duration;
                        st.remaining = None;
                        // A concurrent expiry between its resolve and its
                        // teardown check sees this cleared and stays armed.
                        st.resolution = None;
                        st.suppressed = true;
                        let rearmed = st
                            .timer
                            .as_ref()
                            .map(|timer| timer.reschedule(duration))
                            .unwrap_or(false);
                        if !rearmed {
                            // The old timer lost a cancellation race; arm a
                            // fresh one.
                            if let Some(expire_cb) = st.expire_cb.clone() {
                                st.timer =
                                    Some(self.scheduler.schedule_after(duration, expire_cb));
                            }
                        }
                    }
                    self.sink.send(target, &command);
                    entry.state.lock().unwrap().suppressed = false;
                    return Ok(self.handle_for(entry));
                }
                MapEntry::Vacant(vacant) => {
                    debug!(target, ?duration, "Creating timed command");
                    let entry = Arc::new(TimedCommandEntry {
                        target: target.to_string(),
                        state: Mutex::new(EntryState {
                            resolution: None,
                            timer: None,
                            revert,
                            duration,
                            remaining: None,
                            suppressed: true,
                            listener: None,
                            expire_cb: None,
                            torn_down: false,
                        }),
                    });
                    vacant.insert(entry.clone());

                    let expire_cb = self.expiry_callback(entry.clone());
                    {
                        let mut st = entry.state.lock().unwrap();
                        st.expire_cb = Some(expire_cb.clone());
                        st.listener = Some(self.spawn_listener(entry.clone()));
                    }
                    self.sink.send(target, &command);
                    {
                        let mut st = entry.state.lock().unwrap();
                        st.suppressed = false;
                        st.timer = Some(self.scheduler.schedule_after(duration, expire_cb));
                    }
                    return Ok(self.handle_for(entry));
                }
            }
        }
    }

    /// Number of pending timed commands.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn handle_for(&self, entry: Arc<TimedCommandEntry>) -> TimedCommandHandle {
        TimedCommandHandle::new(entry, self.scheduler.clone())
    }

    fn expiry_callback(&self, entry: Arc<TimedCommandEntry>) -> TimerCallback {
        let entries = self.entries.clone();
        let sink = self.sink.clone();
        let scheduler = self.scheduler.clone();
        Arc::new(move || {
            on_expiry(&entry, &entries, &sink, &scheduler);
        })
    }

    fn spawn_listener(&self, entry: Arc<TimedCommandEntry>) -> tokio::task::JoinHandle<()> {
        let mut rx = self.events.subscribe();
        let entries = self.entries.clone();
        let scheduler = self.scheduler.clone();
        self.runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.target == entry.target => {
                        if on_interrupt(&entry, &entries, &scheduler) {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target = %entry.target, skipped, "Interrupt listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Timer body: resolve as expired, run the revert, tear down unless the
/// revert callback kept the entry alive.
fn on_expiry(
    entry: &Arc<TimedCommandEntry>,
    entries: &EntryMap,
    sink: &Arc<dyn CommandSink>,
    scheduler: &Arc<dyn Scheduler>,
) {
    let action = {
        let mut st = entry.state.lock().unwrap();
        if st.resolution.is_some() || st.torn_down {
            return;
        }
        st.resolution = Some(Resolution::Expired);
        st.suppressed = true;
        st.revert.clone()
    };
    debug!(target = %entry.target, "Timed command expired");
    match action {
        RevertAction::Fixed(value) => sink.send(&entry.target, &value),
        RevertAction::Callback(callback) => {
            let handle = TimedCommandHandle::new(entry.clone(), scheduler.clone());
            callback(&handle);
        }
    }
    finalize(entry, entries);
}

/// Interrupt body. Returns true if the entry was torn down (the listener
/// then exits).
fn on_interrupt(
    entry: &Arc<TimedCommandEntry>,
    entries: &EntryMap,
    scheduler: &Arc<dyn Scheduler>,
) -> bool {
    let callback = {
        let mut st = entry.state.lock().unwrap();
        if st.suppressed || st.resolution.is_some() || st.torn_down {
            return false;
        }
        let timer = st.timer.take();
        st.remaining = timer
            .as_ref()
            .and_then(|t| t.fire_at())
            .map(|at| at.saturating_duration_since(scheduler.now()));
        if let Some(timer) = timer {
            timer.cancel();
        }
        st.resolution = Some(Resolution::Cancelled);
        match &st.revert {
            RevertAction::Callback(callback) => Some(callback.clone()),
            RevertAction::Fixed(_) => None,
        }
    };
    debug!(target = %entry.target, "Timed command interrupted");
    if let Some(callback) = callback {
        let handle = TimedCommandHandle::new(entry.clone(), scheduler.clone());
        callback(&handle);
    }
    finalize(entry, entries)
}

/// After a revert or interrupt callback: if the resolution is still set,
/// the entry is done and gets removed. A cleared resolution means the callback
/// rescheduled or resumed, so the entry stays pending.
fn finalize(entry: &Arc<TimedCommandEntry>, entries: &EntryMap) -> bool {
    let listener = {
        let mut st = entry.state.lock().unwrap();
        st.suppressed = false;
        if st.resolution.is_none() {
            return false;
        }
        st.torn_down = true;
        st.timer = None;
        // The expiry callback captures the entry; dropping it here breaks
        // the cycle so the entry can be freed.
        st.expire_cb = None;
        st.listener.take()
    };
    entries.remove_if(&entry.target, |_, e| Arc::ptr_eq(e, entry));
    if let Some(listener) = listener {
        listener.abort();
    }
    true
}
