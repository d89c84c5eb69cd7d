//! Adapter from the native three-argument callback to `callback(&context)`.
//!
//! The pool calls back with `(instance, context, timer)`. Here the context
//! argument is the adapter itself (`&self`); the instance and timer arguments
//! are accepted and dropped. No other module looks at them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Opaque token for one callback invocation, supplied by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackInstance(usize);

impl CallbackInstance {
    #[inline]
    pub(crate) const fn new(raw: usize) -> Self {
        Self(raw)
    }
}

/// Identity of the native timer object that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawTimer(usize);

impl RawTimer {
    #[inline]
    pub(crate) const fn new(raw: usize) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RawTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The native callback contract.
///
/// Implementors are shared with pool threads and may be invoked concurrently
/// with themselves.
pub trait NativeCallback: Send + Sync + 'static {
    /// Called by the pool each time the timer fires.
    fn invoke(&self, instance: CallbackInstance, timer: RawTimer);

    /// Counters the backend updates around each invocation, if any.
    fn stats(&self) -> Option<&FireStats> {
        None
    }
}

/// User callback shape.
pub type UserCallback<C> = Box<dyn Fn(&C) + Send + Sync + 'static>;

/// Invocation counters shared between an adapter, its handle and the
/// backend that runs it.
#[derive(Debug, Default)]
pub struct FireStats {
    completed: AtomicU64,
    in_flight: AtomicUsize,
    releases: AtomicUsize,
}

impl FireStats {
    /// Number of invocations that have finished, including ones that unwound.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Number of invocations currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Returns `true` once the backend guarantees no new invocation can
    /// start.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.releases.load(Ordering::SeqCst) > 0
    }

    /// Called by the backend when the native timer can no longer start
    /// an invocation.
    pub(crate) fn mark_released(&self) {
        let _previous = self.releases.fetch_add(1, Ordering::SeqCst);
        debug_assert_eq!(_previous, 0, "native timer released twice");
    }

    #[cfg(test)]
    pub(crate) fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

/// One counted invocation. Decrements `in_flight` even if the user
/// callback unwinds.
struct InFlight<'a>(&'a FireStats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a FireStats) -> Self {
        stats.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(stats)
    }

    /// Leaves without counting a completed invocation.
    fn abandon(self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        std::mem::forget(self);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.completed.fetch_add(1, Ordering::AcqRel);
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs one firing of `callback` if `is_open` still holds.
///
/// The invocation is counted in flight before `is_open` is consulted. A
/// backend that closes with a `SeqCst` store and then calls
/// [`FireStats::mark_released`] therefore lets a drainer observe either the
/// skipped job or the running one, never neither.
pub(crate) fn dispatch(
    callback: &dyn NativeCallback,
    instance: CallbackInstance,
    timer: RawTimer,
    is_open: impl FnOnce() -> bool,
) -> bool {
    let flight = callback.stats().map(InFlight::enter);
    if !is_open() {
        if let Some(flight) = flight {
            flight.abandon();
        }
        return false;
    }
    callback.invoke(instance, timer);
    drop(flight);
    true
}

/// Binds a user callback to its context.
///
/// Both are fixed at construction; every firing sees the same pair.
pub struct CallbackAdapter<C> {
    callback: UserCallback<C>,
    context: C,
    stats: Arc<FireStats>,
}

impl<C: Send + Sync + 'static> CallbackAdapter<C> {
    /// Creates an adapter; `stats` is usually shared with the timer handle.
    pub fn new(callback: UserCallback<C>, context: C, stats: Arc<FireStats>) -> Self {
        Self {
            callback,
            context,
            stats,
        }
    }

    /// Returns the context passed to every invocation.
    pub fn context(&self) -> &C {
        &self.context
    }
}

impl<C: Send + Sync + 'static> NativeCallback for CallbackAdapter<C> {
    fn invoke(&self, _instance: CallbackInstance, _timer: RawTimer) {
        (self.callback)(&self.context);
    }

    fn stats(&self) -> Option<&FireStats> {
        Some(&self.stats)
    }
}

impl<C> fmt::Debug for CallbackAdapter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackAdapter")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
