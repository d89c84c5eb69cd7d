//! Thread-pool timers on Windows.
//!
//! Thin layer over `CreateThreadpoolTimer`, `SetThreadpoolTimer` and
//! `CloseThreadpoolTimer` on the process default pool.
//!
//! The callback context handed to the OS is a leaked `Box<Arc<dyn
//! NativeCallback>>`. It must outlive every callback, including ones still
//! running after close, so close submits a cleanup work item that waits for
//! the timer's callbacks, closes the timer and only then frees the context.
//! The thread calling close never waits. The context's stats are marked
//! released once that wait returns, after which no callback can start.

use std::ffi::c_void;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use windows_sys::Win32::Foundation::{FALSE, FILETIME, GetLastError};
use windows_sys::Win32::System::Threading::{
    CloseThreadpoolTimer, CreateThreadpoolTimer, PTP_CALLBACK_INSTANCE, PTP_TIMER,
    SetThreadpoolTimer, TrySubmitThreadpoolCallback, WaitForThreadpoolTimerCallbacks,
};

use crate::callback::{CallbackInstance, NativeCallback, RawTimer, dispatch};
use crate::time::FileTime;
use crate::trace::{debug, error, trace, warn};

type Context = Arc<dyn NativeCallback>;

/// A `TP_TIMER` plus the context its callbacks receive.
pub(crate) struct NativeTimer {
    timer: PTP_TIMER,
    context: *mut Context,
}

// SAFETY: TP_TIMER handles may be used from any thread, and the context is
// only dereferenced through `&`, by pool threads, behind `Send + Sync`.
unsafe impl Send for NativeTimer {}
// SAFETY: see above; `arm` takes `&self` and SetThreadpoolTimer is thread-safe.
unsafe impl Sync for NativeTimer {}

unsafe extern "system" fn on_timer(
    instance: PTP_CALLBACK_INSTANCE,
    context: *mut c_void,
    timer: PTP_TIMER,
) {
    // SAFETY: `context` is the `Box<Context>` leaked in `create`, freed only
    // by `cleanup_timer` after this timer's callbacks have drained.
    let callback = unsafe { &*context.cast::<Context>() };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        dispatch(
            &**callback,
            CallbackInstance::new(instance as usize),
            RawTimer::new(timer as usize),
            || true,
        );
    }));
    if outcome.is_err() {
        error!(timer = %RawTimer::new(timer as usize), "timer callback panicked");
    }
}

/// State moved to the cleanup work item.
struct Cleanup {
    timer: PTP_TIMER,
    context: *mut Context,
}

unsafe extern "system" fn cleanup_timer(_instance: PTP_CALLBACK_INSTANCE, context: *mut c_void) {
    // SAFETY: `context` is the `Box<Cleanup>` leaked in `release`, which
    // gives up ownership once the submission succeeds.
    let cleanup = unsafe { Box::from_raw(context.cast::<Cleanup>()) };
    // SAFETY: the timer was disarmed before submission and is closed exactly
    // once, here. After the wait no callback can still reach `context`.
    unsafe {
        WaitForThreadpoolTimerCallbacks(cleanup.timer, FALSE);
        CloseThreadpoolTimer(cleanup.timer);
        let context = Box::from_raw(cleanup.context);
        if let Some(stats) = context.stats() {
            stats.mark_released();
        }
        drop(context);
    }
    trace!(timer = %RawTimer::new(cleanup.timer as usize), "native timer cleanup finished");
}

impl NativeTimer {
    /// Allocates a timer bound to `callback`. The timer starts disarmed.
    pub(crate) fn create(callback: Context) -> Result<Self, i32> {
        let context = Box::into_raw(Box::new(callback));

        // SAFETY: `on_timer` matches PTP_TIMER_CALLBACK and `context` stays
        // valid until `cleanup_timer` frees it. A null environment selects
        // the default pool.
        let timer = unsafe { CreateThreadpoolTimer(Some(on_timer), context.cast(), ptr::null()) };
        if timer.is_null() {
            // SAFETY: plain FFI call with no arguments.
            let code = unsafe { GetLastError() } as i32;
            // SAFETY: the OS never saw `context`.
            drop(unsafe { Box::from_raw(context) });
            return Err(code);
        }

        debug!(timer = %RawTimer::new(timer as usize), "native timer created");
        Ok(Self { timer, context })
    }

    /// Arms (or with `None`, disarms) the timer.
    pub(crate) fn arm(&self, due: Option<&FileTime>, period_ms: u32, window_length_ms: u32) {
        // `FileTime` is a transparent i64 and Windows is little-endian, so it
        // has the layout of FILETIME { low, high }.
        let due_ptr = due.map_or(ptr::null(), |d| ptr::from_ref(d).cast::<FILETIME>());
        // SAFETY: `self.timer` is live until `release`; the OS copies the due
        // time before returning.
        unsafe { SetThreadpoolTimer(self.timer, due_ptr, period_ms, window_length_ms) };
        trace!(
            timer = %RawTimer::new(self.timer as usize),
            armed = due.is_some(),
            period_ms,
            window_length_ms,
            "native timer armed"
        );
    }

    /// Releases the timer without waiting for running callbacks.
    pub(crate) fn close(self) {
        drop(self);
    }

    fn release(&mut self) {
        let timer = mem::replace(&mut self.timer, ptr::null_mut());
        if timer.is_null() {
            return;
        }

        // SAFETY: live timer; a null due time stops queuing new callbacks.
        unsafe { SetThreadpoolTimer(timer, ptr::null(), 0, 0) };

        let cleanup = Box::into_raw(Box::new(Cleanup {
            timer,
            context: self.context,
        }));
        // SAFETY: `cleanup_timer` matches PTP_SIMPLE_CALLBACK and takes
        // ownership of `cleanup` when the submission succeeds.
        let submitted =
            unsafe { TrySubmitThreadpoolCallback(Some(cleanup_timer), cleanup.cast(), ptr::null()) }
                != FALSE;
        if submitted {
            debug!(timer = %RawTimer::new(timer as usize), "native timer close queued");
            return;
        }

        // SAFETY: not submitted, so ownership never left this thread.
        let cleanup = unsafe { Box::from_raw(cleanup) };
        warn!(
            timer = %RawTimer::new(timer as usize),
            "cleanup submission failed; closing inline and leaking the callback context"
        );
        // SAFETY: closed exactly once. The context leaks: callbacks may still
        // be running, so it is never marked released and a drain times out.
        unsafe { CloseThreadpoolTimer(cleanup.timer) };
    }
}

impl Drop for NativeTimer {
    fn drop(&mut self) {
        self.release();
    }
}
