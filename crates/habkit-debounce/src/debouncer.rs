//! The per-key debounce state machine

use std::sync::{Arc, Mutex};
use std::time::Duration;

use habkit_timer::{Scheduler, TimerHandle, TimerState};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::context::CapturedContext;
use crate::interval::{DebounceConfig, Interval};
use crate::{DebounceError, DebounceResult};

/// A deferred block of work.
pub type DebounceBlock = Arc<dyn Fn() + Send + Sync>;

/// Coalesces a burst of calls into one fire (trailing edge) or an immediate
/// fire plus a suppression window (leading edge).
///
/// One `Debouncer` serves one logical trigger key. All of its mutable state
/// lives behind a single mutex, so concurrent `call`s from different threads
/// cannot both decide "no timer pending" and schedule two timers.
///
/// The most recently supplied block is remembered across cycles: a later
/// `call(None)` reuses it. Only a debouncer that has never seen a block
/// rejects a bare call.
pub struct Debouncer {
    scheduler: Arc<dyn Scheduler>,
    config: DebounceConfig,
    state: Arc<Mutex<DebounceState>>,
}

#[derive(Default)]
struct DebounceState {
    /// Most recently supplied block; survives fires and resets.
    block: Option<DebounceBlock>,
    /// Caller context captured on the latest call.
    context: Option<CapturedContext>,
    /// The pending fire (trailing) or cooldown (leading) timer.
    timer: Option<TimerHandle>,
    /// Start of the current cycle; anchors the max-interval ceiling.
    window_start: Option<Instant>,
    last_call: Option<Instant>,
    /// Leading edge only: a fire has happened and the cooldown is running.
    cycle_open: bool,
    /// Bumped on every new cycle. Timer bodies carry the epoch they were
    /// scheduled under and bail if a newer cycle superseded them while they
    /// were in flight.
    epoch: u64,
}

impl Debouncer {
    pub fn new(scheduler: Arc<dyn Scheduler>, config: DebounceConfig) -> Self {
        Self {
            scheduler,
            config,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    pub fn config(&self) -> &DebounceConfig {
        &self.config
    }

    /// Whether a timer (fire or cooldown) is currently pending.
    pub fn is_pending(&self) -> bool {
        self.state.lock().unwrap().timer.is_some()
    }

    /// Record a call, storing `block` (or reusing the last one when `None`),
    /// and fire / schedule / reschedule according to the configuration.
    ///
    /// Never blocks; a leading-edge fire runs synchronously before this
    /// returns, everything else is deferred to the scheduler.
    pub fn call(&self, block: Option<DebounceBlock>) -> DebounceResult<()> {
        let now = self.scheduler.now();
        let fire_now = {
            let mut st = self.state.lock().unwrap();
            if let Some(block) = block {
                st.block = Some(block);
            }
            if st.block.is_none() {
                return Err(DebounceError::MissingBlock);
            }
            st.context = Some(CapturedContext::capture());
            let since_last = st.last_call.map(|t| now.duration_since(t));
            st.last_call = Some(now);

            if self.config.leading {
                self.leading_call(&mut st, now, since_last)
            } else {
                self.trailing_call(&mut st, now);
                None
            }
        };
        // Leading-edge fires run outside the lock so a reentrant block
        // cannot deadlock.
        if let Some((block, context)) = fire_now {
            context.in_scope(|| block());
        }
        Ok(())
    }

    /// Cancel any pending fire or open cycle without invoking anything.
    ///
    /// Idempotent. Only the pending delivery is discarded: the most
    /// recently supplied block stays remembered, so a later bare `call`
    /// still works (the missing-block error applies only to a debouncer
    /// that has never seen a block). Best-effort with respect to a
    /// concurrently firing timer: a callback that already started
    /// completes.
    pub fn reset(&self) {
        let timer = {
            let mut st = self.state.lock().unwrap();
            st.window_start = None;
            st.last_call = None;
            st.cycle_open = false;
            st.context = None;
            st.timer.take()
        };
        if let Some(timer) = timer {
            timer.cancel();
            trace!("Debouncer reset while pending");
        }
    }

    /// Deliver a pending trailing-edge fire immediately and return to idle.
    ///
    /// No-op when idle, on a leading-edge debouncer (its cooldown carries
    /// nothing to deliver), or when the timer won the race and is already
    /// firing.
    pub fn flush(&self) {
        if self.config.leading {
            return;
        }
        let fired = {
            let mut st = self.state.lock().unwrap();
            match st.timer.take() {
                Some(timer) if timer.cancel() => {
                    st.window_start = None;
                    st.block.clone().zip(st.context.clone())
                }
                // No pending fire, or it is already executing.
                Some(_) | None => None,
            }
        };
        if let Some((block, context)) = fired {
            debug!("Flushing pending debounce");
            context.in_scope(|| block());
        }
    }

    fn trailing_call(&self, st: &mut DebounceState, now: Instant) {
        // A timer whose body has already started counts as gone: re-arming
        // it would orphan the running task. Its body sees the bumped epoch
        // and bails; the burst folds into the fresh cycle instead.
        match pending_timer(st) {
            None => {
                st.epoch += 1;
                let epoch = st.epoch;
                st.window_start = Some(now);
                let state = self.state.clone();
                let timer = self.scheduler.schedule_after(
                    self.config.interval.min(),
                    Arc::new(move || fire_trailing(&state, epoch)),
                );
                st.timer = Some(timer);
                trace!("Started trailing debounce cycle");
            }
            Some(timer) => {
                // A bare duration never reschedules: the fire stays put at
                // window start + interval. A range enforces the debounce
                // floor on every call, capped by the ceiling.
                if let Interval::Range { max, .. } = self.config.interval {
                    let idle = self.config.effective_idle_time();
                    let ceiling = st.window_start.unwrap_or(now) + max;
                    timer.reschedule_at((now + idle).min(ceiling));
                }
            }
        }
    }

    fn leading_call(
        &self,
        st: &mut DebounceState,
        now: Instant,
        since_last: Option<Duration>,
    ) -> Option<(DebounceBlock, CapturedContext)> {
        let idle = self.config.effective_idle_time();
        let fresh_burst = !st.cycle_open || since_last.map_or(true, |d| d > idle);
        if fresh_burst {
            if let Some(stale) = st.timer.take() {
                stale.cancel();
            }
            st.epoch += 1;
            let epoch = st.epoch;
            st.window_start = Some(now);
            st.cycle_open = true;
            let state = self.state.clone();
            st.timer = Some(
                self.scheduler
                    .schedule_after(idle, Arc::new(move || close_cycle(&state, epoch))),
            );
            debug!("Leading-edge fire, new cycle");
            st.block.clone().zip(st.context.clone())
        } else {
            if let Interval::Range { max, .. } = self.config.interval {
                let ceiling = st.window_start.unwrap_or(now) + max;
                if let Some(timer) = pending_timer(st) {
                    timer.reschedule_at((now + idle).min(ceiling));
                }
            }
            None
        }
    }
}

/// The pending timer, ignoring one whose body has already started firing.
fn pending_timer(st: &DebounceState) -> Option<TimerHandle> {
    st.timer
        .as_ref()
        .filter(|timer| timer.state() == TimerState::Scheduled)
        .cloned()
}

/// Trailing-edge timer body: clear pending state, then invoke.
///
/// State is cleared before the block runs so a panicking block cannot leave
/// the debouncer wedged in "pending".
fn fire_trailing(state: &Arc<Mutex<DebounceState>>, epoch: u64) {
    let fired = {
        let mut st = state.lock().unwrap();
        if st.epoch != epoch {
            // A newer cycle superseded this fire while it waited for the
            // lock; its block is delivered by that cycle's own timer.
            return;
        }
        st.timer = None;
        st.window_start = None;
        st.block.clone().zip(st.context.clone())
    };
    if let Some((block, context)) = fired {
        context.in_scope(|| block());
    }
}

/// Leading-edge cooldown body: close the cycle. Does not invoke the block.
fn close_cycle(state: &Arc<Mutex<DebounceState>>, epoch: u64) {
    let mut st = state.lock().unwrap();
    if st.epoch != epoch {
        return;
    }
    st.timer = None;
    st.window_start = None;
    st.cycle_open = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use habkit_timer::TokioScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time;

    fn trailing(interval: Interval) -> Debouncer {
        Debouncer::new(
            Arc::new(TokioScheduler::new().unwrap()),
            DebounceConfig::trailing(interval),
        )
    }

    fn leading(interval: Interval) -> Debouncer {
        Debouncer::new(
            Arc::new(TokioScheduler::new().unwrap()),
            DebounceConfig::leading(interval),
        )
    }

    fn fixed(ms: u64) -> Interval {
        Interval::fixed(Duration::from_millis(ms)).unwrap()
    }

    fn range(min_ms: u64, max_ms: u64) -> Interval {
        Interval::range(Duration::from_millis(min_ms), Duration::from_millis(max_ms)).unwrap()
    }

    fn marker(slot: &Arc<AtomicUsize>, value: usize) -> DebounceBlock {
        let slot = slot.clone();
        Arc::new(move || {
            slot.store(value, Ordering::SeqCst);
        })
    }

    fn counter(count: &Arc<AtomicUsize>) -> DebounceBlock {
        let count = count.clone();
        Arc::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn settle() {
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_to_last_block() {
        // Calls at t=0, t=10, t=50 with distinct markers; exactly one
        // invocation at t=100 running the t=50 marker.
        let debouncer = trailing(fixed(100));
        let fired = Arc::new(AtomicUsize::new(0));
        let slot = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        let mark = slot.clone();
        let block_for = |value: usize| -> DebounceBlock {
            let count = count.clone();
            let mark = mark.clone();
            Arc::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
                mark.store(value, Ordering::SeqCst);
            })
        };

        debouncer.call(Some(block_for(1))).unwrap();
        time::advance(Duration::from_millis(10)).await;
        debouncer.call(Some(block_for(2))).unwrap();
        time::advance(Duration::from_millis(40)).await;
        debouncer.call(Some(block_for(3))).unwrap();

        time::advance(Duration::from_millis(49)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(slot.load(Ordering::SeqCst), 3);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_after_fire_starts_new_cycle() {
        let debouncer = trailing(fixed(100));
        let fired = Arc::new(AtomicUsize::new(0));

        debouncer.call(Some(counter(&fired))).unwrap();
        time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        debouncer.call(None).unwrap();
        time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bare_call_without_block_fails() {
        let debouncer = trailing(fixed(100));
        assert_eq!(debouncer.call(None), Err(DebounceError::MissingBlock));
    }

    #[tokio::test(start_paused = true)]
    async fn range_extends_fire_on_each_call() {
        // floor 100ms, ceiling 500ms: fires 100ms after the burst's last
        // call.
        let debouncer = trailing(range(100, 500));
        let fired = Arc::new(AtomicUsize::new(0));

        debouncer.call(Some(counter(&fired))).unwrap();
        for _ in 0..3 {
            time::advance(Duration::from_millis(50)).await;
            debouncer.call(None).unwrap();
        }
        // Last call at t=150; fire due at t=250.
        time::advance(Duration::from_millis(99)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn range_ceiling_forces_fire() {
        // Continuous calls spaced below the floor still fire by
        // window start + max.
        let debouncer = trailing(range(100, 300));
        let fired = Arc::new(AtomicUsize::new(0));

        debouncer.call(Some(counter(&fired))).unwrap();
        for _ in 0..5 {
            time::advance(Duration::from_millis(50)).await;
            debouncer.call(None).unwrap();
        }
        // Last call at t=250 would push the fire to t=350, but the ceiling
        // pins it at t=300.
        time::advance(Duration::from_millis(49)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leading_fires_synchronously() {
        let debouncer = leading(fixed(100));
        let fired = Arc::new(AtomicUsize::new(0));

        debouncer.call(Some(counter(&fired))).unwrap();
        // Before any timer has a chance to run.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leading_suppresses_rest_of_cycle() {
        let debouncer = leading(fixed(100));
        let fired = Arc::new(AtomicUsize::new(0));

        debouncer.call(Some(counter(&fired))).unwrap();
        time::advance(Duration::from_millis(10)).await;
        debouncer.call(None).unwrap();
        time::advance(Duration::from_millis(40)).await;
        debouncer.call(None).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Cooldown closed at t=100; the next call is a fresh burst.
        time::advance(Duration::from_millis(100)).await;
        settle().await;
        debouncer.call(None).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn leading_range_extends_cooldown_to_ceiling() {
        let debouncer = leading(range(100, 250));
        let fired = Arc::new(AtomicUsize::new(0));

        debouncer.call(Some(counter(&fired))).unwrap();
        for _ in 0..4 {
            time::advance(Duration::from_millis(50)).await;
            debouncer.call(None).unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Calls at t=50..200 kept pushing the cooldown, but never past the
        // t=250 ceiling. A call after that is a fresh burst.
        time::advance(Duration::from_millis(60)).await;
        settle().await;
        debouncer.call(None).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_on_idle_is_noop() {
        let debouncer = trailing(fixed(100));
        debouncer.reset();
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_pending_fire() {
        let debouncer = trailing(fixed(100));
        let fired = Arc::new(AtomicUsize::new(0));

        debouncer.call(Some(counter(&fired))).unwrap();
        debouncer.reset();

        time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // The remembered block survives reset.
        debouncer.call(None).unwrap();
        time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_fires_immediately_and_idles() {
        let debouncer = trailing(fixed(100));
        let fired = Arc::new(AtomicUsize::new(0));

        debouncer.call(Some(counter(&fired))).unwrap();
        debouncer.flush();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());

        // The cancelled timer must not fire later.
        time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_on_idle_is_noop() {
        let debouncer = trailing(fixed(100));
        let fired = Arc::new(AtomicUsize::new(0));
        debouncer.call(Some(counter(&fired))).unwrap();
        time::advance(Duration::from_millis(100)).await;
        settle().await;

        debouncer.flush();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_timer_body_does_not_fire() {
        let debouncer = trailing(fixed(100));
        let fired = Arc::new(AtomicUsize::new(0));
        debouncer.call(Some(counter(&fired))).unwrap();

        // A timer body left over from an earlier cycle reaches the lock
        // after a newer cycle replaced it: it must neither invoke the block
        // nor clear the pending cycle.
        fire_trailing(&debouncer.state, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(debouncer.is_pending());

        time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn call_during_in_flight_fire_starts_fresh_cycle() {
        // A handle whose timer already started firing must count as "no
        // timer pending", so the call opens a new cycle instead of
        // re-arming the finished task.
        let scheduler = Arc::new(TokioScheduler::new().unwrap());
        let debouncer = Debouncer::new(scheduler.clone(), DebounceConfig::trailing(fixed(100)));
        let fired = Arc::new(AtomicUsize::new(0));

        debouncer.call(Some(counter(&fired))).unwrap();
        time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let mid_fire = scheduler.schedule_after(Duration::from_millis(1), Arc::new(|| {}));
        time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(mid_fire.state(), habkit_timer::TimerState::Executed);
        debouncer.state.lock().unwrap().timer = Some(mid_fire);

        debouncer.call(None).unwrap();
        time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn last_marker_wins_in_overlapping_cycles() {
        let debouncer = trailing(fixed(100));
        let slot = Arc::new(AtomicUsize::new(0));

        debouncer.call(Some(marker(&slot, 1))).unwrap();
        time::advance(Duration::from_millis(60)).await;
        debouncer.call(Some(marker(&slot, 2))).unwrap();

        time::advance(Duration::from_millis(40)).await;
        settle().await;
        assert_eq!(slot.load(Ordering::SeqCst), 2);
    }
}
