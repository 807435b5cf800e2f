//! Debounce and throttle coalescing for scripting-layer automations
//!
//! This crate collapses rapid bursts of triggers into the small number of
//! invocations an automation author actually wants:
//!
//! - [`Debouncer`] is the per-key state machine: trailing-edge by default
//!   (fire after the burst goes quiet), leading-edge on request (fire on the
//!   first trigger of a burst, suppress the rest), with an optional
//!   max-interval ceiling so a never-ending burst still fires periodically.
//! - [`DebounceRegistry`] maps arbitrary keys to debouncers with an atomic
//!   get-or-create, and carries the scripting-DSL entry points
//!   (`debounce_for`, `throttle_for`, `only_every`).
//!
//! All timing is delegated to a [`habkit_timer::Scheduler`], so the whole
//! crate tests under tokio's paused clock with no wall-clock sleeps.

mod context;
mod debouncer;
mod interval;
mod registry;

pub use context::CapturedContext;
pub use debouncer::{DebounceBlock, Debouncer};
pub use interval::{DebounceConfig, Interval};
pub use registry::DebounceRegistry;

use std::time::Duration;
use thiserror::Error;

/// Debounce errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DebounceError {
    #[error("debounce interval must be greater than zero")]
    InvalidInterval,

    #[error("invalid debounce interval range: min {min:?} exceeds max {max:?}")]
    InvalidRange { min: Duration, max: Duration },

    #[error("no block supplied and none previously recorded")]
    MissingBlock,
}

/// Result type for debounce operations
pub type DebounceResult<T> = Result<T, DebounceError>;
