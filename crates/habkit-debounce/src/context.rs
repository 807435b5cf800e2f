//! Captured caller context for deferred invocations
//!
//! A deferred block runs on a timer worker, not on the thread that asked for
//! the debounce. Anything ambient the caller had set up for logging (the
//! current tracing span, typically a rule's span) would be lost. Instead of
//! relying on thread-local state surviving the hop, the debouncer captures
//! the caller's span into an explicit value at call time and re-enters it
//! around the deferred invocation.

use tracing::Span;

/// The caller-side context captured at `call` time and replayed when the
/// deferred block runs.
#[derive(Debug, Clone)]
pub struct CapturedContext {
    span: Span,
}

impl CapturedContext {
    /// Capture the current tracing span.
    pub fn capture() -> Self {
        Self {
            span: Span::current(),
        }
    }

    /// The captured span.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Run `f` with the captured span entered.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        self.span.in_scope(f)
    }
}
