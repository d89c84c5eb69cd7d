//! Disposable thread-pool timer handle.
//!
//! A [`TimerHandle`] owns one native timer and the due-time buffer it was
//! armed with. Both live in a single heap allocation published through an
//! [`AtomicPtr`]. Release, whether from [`TimerHandle::dispose`] or `Drop`,
//! swaps that pointer to null: whoever gets the non-null value frees the
//! resource, everyone else sees null and does nothing.
//!
//! # State machine
//!
//! ```text
//! Created --start--> Active --dispose/drop--> Disposed
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use tptimer::TimerHandle;
//!
//! let ticks = Arc::new(AtomicU32::new(0));
//! let timer = TimerHandle::start_relative(
//!     |ticks: &Arc<AtomicU32>| {
//!         ticks.fetch_add(1, Ordering::Relaxed);
//!     },
//!     Arc::clone(&ticks),
//!     0,   // first firing as soon as possible
//!     100, // then every 100 ms
//! )?;
//!
//! std::thread::sleep(std::time::Duration::from_millis(350));
//! timer.dispose();
//! # Ok::<(), tptimer::TimerError>(())
//! ```

use std::fmt;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, SystemTime};

use minstant::Instant;

use crate::callback::{CallbackAdapter, FireStats, UserCallback};
use crate::error::TimerError;
use crate::sys::NativeTimer;
use crate::time::{DueTime, FileTime};
use crate::trace::{debug, info, warn};

/// Sleep between in-flight checks in [`TimerHandle::dispose_and_drain`].
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Lifecycle state of a [`TimerHandle`]. Only ever moves forward.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerState {
    /// Identity allocated, native timer not yet armed.
    Created = 0,
    /// Native timer armed and owned by the handle.
    Active = 1,
    /// Native timer released. Terminal.
    Disposed = 2,
}

impl TimerState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Active,
            _ => Self::Disposed,
        }
    }
}

/// The native timer and its due-time buffer. Allocated and freed together.
struct Resource {
    native: NativeTimer,
    due_time: FileTime,
}

/// Handle to an armed thread-pool timer.
///
/// Callbacks run on pool threads and may overlap each other when a callback
/// outlives the period. The handle does not synchronize access to the
/// context; the callback must.
///
/// Dropping the handle disposes it.
pub struct TimerHandle {
    resource: AtomicPtr<Resource>,
    state: AtomicU8,
    stats: Arc<FireStats>,
    due: DueTime,
    period_ms: u32,
    window_length_ms: u32,
}

impl TimerHandle {
    /// Starts a timer that first fires at `due_utc`, then every `period_ms`
    /// (0 fires once). An instant in the past fires as soon as possible.
    ///
    /// # Errors
    ///
    /// [`TimerError::DueTimeOutOfRange`] if `due_utc` predates 1601, and
    /// [`TimerError::CreationFailed`] if the native timer cannot be created.
    pub fn start_absolute<C, F>(
        callback: F,
        context: C,
        due_utc: SystemTime,
        period_ms: u32,
    ) -> Result<Self, TimerError>
    where
        C: Send + Sync + 'static,
        F: Fn(&C) + Send + Sync + 'static,
    {
        TimerBuilder::new(context)
            .callback(callback)
            .due(DueTime::At(due_utc))
            .period_ms(period_ms)
            .start()
    }

    /// Starts a timer that first fires `initial_delay_ms` from now, then
    /// every `period_ms` (0 fires once).
    ///
    /// # Errors
    ///
    /// [`TimerError::CreationFailed`] if the native timer cannot be created.
    pub fn start_relative<C, F>(
        callback: F,
        context: C,
        initial_delay_ms: u32,
        period_ms: u32,
    ) -> Result<Self, TimerError>
    where
        C: Send + Sync + 'static,
        F: Fn(&C) + Send + Sync + 'static,
    {
        TimerBuilder::new(context)
            .callback(callback)
            .due(DueTime::After(initial_delay_ms))
            .period_ms(period_ms)
            .start()
    }

    fn created(due: DueTime, period_ms: u32, window_length_ms: u32) -> Self {
        Self {
            resource: AtomicPtr::new(ptr::null_mut()),
            state: AtomicU8::new(TimerState::Created as u8),
            stats: Arc::new(FireStats::default()),
            due,
            period_ms,
            window_length_ms,
        }
    }

    fn activate(&self, resource: Box<Resource>) {
        let previous = self.resource.swap(Box::into_raw(resource), Ordering::AcqRel);
        debug_assert!(previous.is_null(), "timer activated twice");
        self.state.store(TimerState::Active as u8, Ordering::Release);
    }

    /// Releases the native timer. Idempotent and non-blocking.
    ///
    /// Future firings stop. A callback already running is not interrupted
    /// and may still be running when this returns. Safe to call from any
    /// thread, concurrently, and from inside the timer's own callback.
    pub fn dispose(&self) {
        // Every caller leaves with `Disposed` visible, not only the winner.
        self.state.store(TimerState::Disposed as u8, Ordering::Release);
        let raw = self.resource.swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            return;
        }

        // SAFETY: `raw` came from `Box::into_raw` in `activate`, and the swap
        // above made this call its only owner.
        let resource = unsafe { Box::from_raw(raw) };
        let Resource {
            native,
            due_time: _due_time,
        } = *resource;
        native.close();
        debug!(
            due_ticks = _due_time.ticks(),
            fired = self.stats.completed(),
            "timer disposed"
        );
    }

    /// Disposes, then waits up to `timeout` for running callbacks to return.
    ///
    /// Returns `true` once the native timer is released and no callback is
    /// running; no callback starts after that. Calling this from inside the
    /// timer's own callback always waits the full timeout and returns
    /// `false`.
    pub fn dispose_and_drain(&self, timeout: Duration) -> bool {
        self.dispose();
        let deadline = Instant::now() + timeout;
        loop {
            if self.stats.is_released() && self.stats.in_flight() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(in_flight = self.stats.in_flight(), "timer drain timed out");
                return false;
            }
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TimerState {
        TimerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` until the handle is disposed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.resource.load(Ordering::Acquire).is_null()
    }

    /// First due time as given at start.
    #[must_use]
    pub const fn due(&self) -> DueTime {
        self.due
    }

    /// Period in milliseconds; 0 means one-shot.
    #[must_use]
    pub const fn period_ms(&self) -> u32 {
        self.period_ms
    }

    /// Batching allowance passed to the native timer.
    #[must_use]
    pub const fn window_length_ms(&self) -> u32 {
        self.window_length_ms
    }

    /// Number of callback invocations that have finished.
    #[must_use]
    pub fn fire_count(&self) -> u64 {
        self.stats.completed()
    }

    /// Number of callback invocations running right now.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.stats.in_flight()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("state", &self.state())
            .field("due", &self.due)
            .field("period_ms", &self.period_ms)
            .field("window_length_ms", &self.window_length_ms)
            .field("fired", &self.stats.completed())
            .finish()
    }
}

/// Builder for a [`TimerHandle`] with every option exposed.
///
/// ```no_run
/// use tptimer::{DueTime, TimerBuilder};
///
/// let timer = TimerBuilder::new(String::from("tick"))
///     .callback(|msg: &String| println!("{msg}"))
///     .due(DueTime::After(250))
///     .period_ms(1000)
///     .window_length_ms(50)
///     .start()?;
/// # drop(timer);
/// # Ok::<(), tptimer::TimerError>(())
/// ```
pub struct TimerBuilder<C> {
    context: C,
    callback: Option<UserCallback<C>>,
    due: DueTime,
    period_ms: u32,
    window_length_ms: u32,
}

impl<C: Send + Sync + 'static> TimerBuilder<C> {
    /// Starts a builder around the context every invocation receives.
    ///
    /// Defaults: fire as soon as possible, once, no batching window.
    pub fn new(context: C) -> Self {
        Self {
            context,
            callback: None,
            due: DueTime::default(),
            period_ms: 0,
            window_length_ms: 0,
        }
    }

    /// Sets the callback.
    #[must_use]
    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&C) + Send + Sync + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Sets the first due time.
    #[must_use]
    pub fn due(mut self, due: DueTime) -> Self {
        self.due = due;
        self
    }

    /// Sets the period in milliseconds; 0 fires once.
    #[must_use]
    pub fn period_ms(mut self, period_ms: u32) -> Self {
        self.period_ms = period_ms;
        self
    }

    /// Lets the platform delay each firing by up to this many milliseconds
    /// to batch wake-ups.
    #[must_use]
    pub fn window_length_ms(mut self, window_length_ms: u32) -> Self {
        self.window_length_ms = window_length_ms;
        self
    }

    /// Creates and arms the native timer.
    ///
    /// # Errors
    ///
    /// [`TimerError::MissingCallback`] without a callback,
    /// [`TimerError::DueTimeOutOfRange`] for an unencodable instant, and
    /// [`TimerError::CreationFailed`] if the native timer cannot be created.
    pub fn start(self) -> Result<TimerHandle, TimerError> {
        let callback = self.callback.ok_or(TimerError::MissingCallback)?;
        let due_time = self.due.encode()?;

        // The handle's identity and the adapter exist before the native
        // timer; the timer only ever sees the adapter through a shared Arc.
        let handle = TimerHandle::created(self.due, self.period_ms, self.window_length_ms);
        let adapter = Arc::new(CallbackAdapter::new(
            callback,
            self.context,
            Arc::clone(&handle.stats),
        ));

        let native = NativeTimer::create(adapter).map_err(|code| {
            warn!(code, "native timer creation failed");
            TimerError::CreationFailed { code }
        })?;
        let resource = Box::new(Resource { native, due_time });
        resource.native.arm(
            Some(&resource.due_time),
            self.period_ms,
            self.window_length_ms,
        );
        handle.activate(resource);

        info!(
            due = ?self.due,
            due_ticks = due_time.ticks(),
            period_ms = self.period_ms,
            window_length_ms = self.window_length_ms,
            "timer started"
        );
        Ok(handle)
    }
}

impl<C> fmt::Debug for TimerBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerBuilder")
            .field("has_callback", &self.callback.is_some())
            .field("due", &self.due)
            .field("period_ms", &self.period_ms)
            .field("window_length_ms", &self.window_length_ms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;

    const FAR_FUTURE_MS: u32 = 60_000;

    fn idle_timer() -> TimerHandle {
        TimerHandle::start_relative(|_: &()| {}, (), FAR_FUTURE_MS, 0).unwrap()
    }

    fn assert_send_sync<T: Send + Sync>() {}

    fn wait_released(timer: &TimerHandle) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !timer.stats.is_released() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        timer.stats.is_released()
    }

    #[test]
    fn handle_is_send_and_sync() {
        assert_send_sync::<TimerHandle>();
    }

    #[test]
    fn builder_without_callback_is_rejected() {
        let err = TimerBuilder::new(()).period_ms(10).start().unwrap_err();
        assert_eq!(err, TimerError::MissingCallback);
    }

    #[test]
    fn unencodable_instant_is_rejected_before_creation() {
        let too_early = SystemTime::UNIX_EPOCH - Duration::from_secs(20_000_000_000);
        let err = TimerHandle::start_absolute(|_: &()| {}, (), too_early, 0).unwrap_err();
        assert_eq!(err, TimerError::DueTimeOutOfRange(too_early));
    }

    #[test]
    fn started_timer_is_active() {
        let timer = idle_timer();
        assert_eq!(timer.state(), TimerState::Active);
        assert!(timer.is_active());
        assert_eq!(timer.due(), DueTime::After(FAR_FUTURE_MS));
        assert_eq!(timer.period_ms(), 0);
        assert_eq!(timer.window_length_ms(), 0);
        assert_eq!(timer.fire_count(), 0);
    }

    #[test]
    fn dispose_is_idempotent() {
        let timer = idle_timer();
        timer.dispose();
        assert_eq!(timer.state(), TimerState::Disposed);
        assert!(!timer.is_active());

        timer.dispose();
        timer.dispose();
        assert_eq!(timer.state(), TimerState::Disposed);
    }

    #[test]
    fn dispose_releases_context_exactly_once() {
        let token = Arc::new(());
        let timer =
            TimerHandle::start_relative(|_: &Arc<()>| {}, Arc::clone(&token), FAR_FUTURE_MS, 0)
                .unwrap();
        assert_eq!(Arc::strong_count(&token), 2);

        timer.dispose();
        timer.dispose();
        drop(timer);

        let deadline = Instant::now() + Duration::from_secs(2);
        while Arc::strong_count(&token) > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(Arc::strong_count(&token), 1);
    }

    #[test]
    fn concurrent_dispose_from_many_threads() {
        const THREADS: usize = 8;
        let timer = Arc::new(idle_timer());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let timer = Arc::clone(&timer);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    timer.dispose();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(timer.state(), TimerState::Disposed);
        assert!(wait_released(&timer));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(timer.stats.release_count(), 1);
    }

    #[test]
    fn every_disposer_returns_with_disposed_state() {
        const THREADS: usize = 8;
        let timer = Arc::new(idle_timer());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let timer = Arc::clone(&timer);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    timer.dispose();
                    timer.state()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), TimerState::Disposed);
        }
    }

    #[test]
    fn repeated_dispose_and_drop_release_native_once() {
        let timer = idle_timer();
        timer.dispose();
        timer.dispose();
        assert!(timer.dispose_and_drain(Duration::from_secs(1)));
        assert_eq!(timer.stats.release_count(), 1);

        let stats = Arc::clone(&timer.stats);
        drop(timer);
        assert_eq!(stats.release_count(), 1);
    }

    #[test]
    fn drop_after_dispose_is_noop() {
        let timer = idle_timer();
        timer.dispose();
        drop(timer);
    }

    #[test]
    fn dispose_before_due_prevents_firing() {
        let hits = Arc::new(AtomicUsize::new(0));
        let timer = TimerHandle::start_relative(
            |hits: &Arc<AtomicUsize>| {
                hits.fetch_add(1, Ordering::SeqCst);
            },
            Arc::clone(&hits),
            100,
            0,
        )
        .unwrap();
        timer.dispose();

        thread::sleep(Duration::from_millis(250));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(timer.fire_count(), 0);
    }

    #[test]
    fn drain_with_nothing_running_returns_immediately() {
        let timer = idle_timer();
        assert!(timer.dispose_and_drain(Duration::from_millis(10)));
        assert_eq!(timer.state(), TimerState::Disposed);
    }

    #[test]
    fn builder_keeps_window_length() {
        let timer = TimerBuilder::new(())
            .callback(|_: &()| {})
            .due(DueTime::After(FAR_FUTURE_MS))
            .period_ms(500)
            .window_length_ms(25)
            .start()
            .unwrap();
        assert_eq!(timer.period_ms(), 500);
        assert_eq!(timer.window_length_ms(), 25);
    }

    #[test]
    fn state_order_is_monotonic() {
        assert!(TimerState::Created < TimerState::Active);
        assert!(TimerState::Active < TimerState::Disposed);
        assert_eq!(TimerState::from_u8(7), TimerState::Disposed);
    }
}
