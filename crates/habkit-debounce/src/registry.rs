//! Keyed debouncer registry
//!
//! Maps arbitrary keys to [`Debouncer`] instances with an atomic
//! get-or-create, so concurrent first calls for the same key cannot race
//! into two debouncers. Also hosts the scripting-DSL convenience entry
//! points (`debounce_for`, `throttle_for`, `only_every`).

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use habkit_timer::Scheduler;
use tracing::trace;

use crate::debouncer::{DebounceBlock, Debouncer};
use crate::interval::{DebounceConfig, Interval};
use crate::DebounceResult;

/// A concurrent map of per-key debouncers.
///
/// Entries are created lazily on first use and never evicted; the registry
/// is an explicitly owned object (not a process-wide singleton), so dropping
/// it releases every debouncer it created. Owners with unbounded key
/// cardinality should reuse stable keys or keep their own lifecycle around
/// this type.
pub struct DebounceRegistry<K = String>
where
    K: Eq + Hash + Clone,
{
    scheduler: Arc<dyn Scheduler>,
    debouncers: DashMap<K, Arc<Debouncer>>,
}

impl<K> DebounceRegistry<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            debouncers: DashMap::new(),
        }
    }

    /// Route a call through the debouncer for `key`, creating it with
    /// `config` on first use.
    ///
    /// Configuration is first-writer-wins: if the key already has a
    /// debouncer, `config` is silently ignored and the original settings
    /// stay in effect.
    pub fn debounce(&self, key: K, config: DebounceConfig, block: DebounceBlock) -> DebounceResult<()> {
        let debouncer = self
            .debouncers
            .entry(key)
            .or_insert_with(|| {
                trace!("Creating debouncer");
                Arc::new(Debouncer::new(self.scheduler.clone(), config))
            })
            .clone();
        debouncer.call(Some(block))
    }

    /// Trailing-edge debounce: fire once the burst goes quiet (or at the
    /// range ceiling).
    pub fn debounce_for(&self, key: K, interval: Interval, block: DebounceBlock) -> DebounceResult<()> {
        self.debounce(key, DebounceConfig::trailing(interval), block)
    }

    /// Throttle: coalesce a burst and fire the latest block exactly
    /// `period` after the burst began.
    pub fn throttle_for(&self, key: K, period: Duration, block: DebounceBlock) -> DebounceResult<()> {
        let interval = Interval::range(period, period)?;
        self.debounce(key, DebounceConfig::trailing(interval), block)
    }

    /// Rate limit: fire immediately, then suppress further calls for
    /// `period`.
    pub fn only_every(&self, key: K, period: Duration, block: DebounceBlock) -> DebounceResult<()> {
        let interval = Interval::fixed(period)?;
        self.debounce(key, DebounceConfig::leading(interval), block)
    }

    /// The debouncer for `key`, if one exists.
    pub fn get(&self, key: &K) -> Option<Arc<Debouncer>> {
        self.debouncers.get(key).map(|entry| entry.clone())
    }

    /// Cancel any pending work for `key` without invoking it.
    pub fn reset(&self, key: &K) {
        if let Some(debouncer) = self.get(key) {
            debouncer.reset();
        }
    }

    /// Deliver a pending trailing-edge fire for `key` immediately.
    pub fn flush(&self, key: &K) {
        if let Some(debouncer) = self.get(key) {
            debouncer.flush();
        }
    }

    pub fn len(&self) -> usize {
        self.debouncers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.debouncers.is_empty()
    }
}
