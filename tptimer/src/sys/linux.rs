//! Thread-pool timers on Linux.
//!
//! Every native timer is a non-blocking `timerfd` on `CLOCK_REALTIME`:
//! absolute due times are armed with `TFD_TIMER_ABSTIME`, relative ones
//! without it, so relative waits are unaffected by wall-clock steps.
//!
//! A single poller thread waits on all of them with mio. An expiry becomes a
//! job on a shared queue served by the worker threads. Each timer has at most
//! one job queued: expirations that arrive while it is still waiting merge
//! into it, so a slow timer cannot back up the queue for the others. A worker
//! clears the flag before running the callback, which lets firings of one
//! timer overlap when a callback outlives the period.
//!
//! ```text
//! timerfd ──readable──> tptimer-poll ──job──> tptimer-worker-N ──> callback
//! ```

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, OwnedFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use rustix::io::Errno;
use rustix::time::{
    Itimerspec, TimerfdClockId, TimerfdFlags, TimerfdTimerFlags, Timespec, timerfd_create,
    timerfd_settime,
};

use crate::callback::{CallbackInstance, NativeCallback, RawTimer, dispatch};
use crate::config::{PoolConfig, pool_config};
use crate::time::{DueKind, FileTime};
use crate::trace::{debug, error, info, trace, warn};

/// Maximum readiness events handled per poll.
const EVENTS_CAPACITY: usize = 256;

/// A zero `it_value` disarms a timerfd; due times are clamped to this.
const MIN_DUE: Duration = Duration::from_nanos(1);

/// Name of the poller thread.
const POLLER_THREAD_NAME: &str = "tptimer-poll";

type Entries = Mutex<HashMap<Token, Arc<Entry>>>;

/// A registered timer as seen by the poller and workers.
struct Entry {
    fd: OwnedFd,
    callback: Arc<dyn NativeCallback>,
    id: RawTimer,
    /// A job for this entry sits in the queue.
    pending: AtomicBool,
    closed: AtomicBool,
}

impl Entry {
    /// Reads all pending expirations. Returns the total count.
    fn drain(&self) -> u64 {
        let mut total = 0u64;
        let mut buf = [0u8; 8];
        loop {
            match rustix::io::read(&self.fd, &mut buf[..]) {
                Ok(8) => total = total.saturating_add(u64::from_ne_bytes(buf)),
                Ok(_) | Err(Errno::AGAIN) => return total,
                Err(Errno::INTR) => {}
                Err(_e) => {
                    warn!(timer = %self.id, error = %_e, "timerfd read failed");
                    return total;
                }
            }
        }
    }

    /// Runs the callback unless the timer was closed after the job was
    /// queued. Returns `false` for a skipped job.
    fn fire(&self, worker: usize) -> bool {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            dispatch(
                &*self.callback,
                CallbackInstance::new(worker),
                self.id,
                || !self.closed.load(Ordering::SeqCst),
            )
        }));
        outcome.unwrap_or_else(|_| {
            error!(timer = %self.id, worker, "timer callback panicked");
            true
        })
    }
}

/// Process-wide timer service: one poller, a fixed set of workers.
struct TimerPool {
    registry: Registry,
    entries: Arc<Entries>,
    next_token: AtomicUsize,
}

static POOL: OnceLock<TimerPool> = OnceLock::new();
static POOL_START: Mutex<()> = Mutex::new(());

/// Returns the running pool, starting it on first use.
///
/// Only a started pool is cached; after a failed start the next call tries
/// again.
fn pool() -> Result<&'static TimerPool, i32> {
    get_or_start(&POOL, &POOL_START, || TimerPool::spawn(pool_config()))
}

fn get_or_start<'a, T>(
    cell: &'a OnceLock<T>,
    start_lock: &Mutex<()>,
    start: impl FnOnce() -> io::Result<T>,
) -> Result<&'a T, i32> {
    if let Some(running) = cell.get() {
        return Ok(running);
    }
    let _starting = lock(start_lock);
    if let Some(running) = cell.get() {
        return Ok(running);
    }
    let started = start().map_err(|e| {
        error!(error = %e, "failed to start timer pool");
        e.raw_os_error().unwrap_or(-1)
    })?;
    Ok(cell.get_or_init(|| started))
}

impl TimerPool {
    fn spawn(config: &PoolConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let entries = Arc::new(Entries::default());

        let (job_tx, job_rx) = mpsc::channel::<Arc<Entry>>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        for index in 0..config.worker_count() {
            let jobs = Arc::clone(&job_rx);
            thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name))
                .spawn(move || worker_loop(index, &jobs))?;
        }

        let poller_entries = Arc::clone(&entries);
        thread::Builder::new()
            .name(POLLER_THREAD_NAME.into())
            .spawn(move || poll_loop(poll, &poller_entries, &job_tx))?;

        info!(workers = config.worker_count(), "timer pool started");

        Ok(Self {
            registry,
            entries,
            next_token: AtomicUsize::new(1),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn worker_loop(index: usize, jobs: &Mutex<Receiver<Arc<Entry>>>) {
    debug!(worker = index, "worker started");
    loop {
        let next = lock(jobs).recv();
        let Ok(entry) = next else {
            break;
        };
        entry.pending.store(false, Ordering::Release);
        if !entry.fire(index) {
            trace!(timer = %entry.id, "dropping job for closed timer");
        }
    }
    debug!(worker = index, "worker exiting");
}

fn poll_loop(mut poll: Poll, entries: &Entries, jobs: &Sender<Arc<Entry>>) {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);
    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "timer poller failed; no further callbacks");
            return;
        }

        for event in &events {
            let entry = lock(entries).get(&event.token()).cloned();
            let Some(entry) = entry else {
                continue;
            };

            let expirations = entry.drain();
            if expirations == 0 || entry.closed.load(Ordering::Acquire) {
                continue;
            }
            if expirations > 1 {
                trace!(timer = %entry.id, expirations, "overrun expirations coalesced");
            }
            if entry.pending.swap(true, Ordering::AcqRel) {
                trace!(timer = %entry.id, expirations, "merged into queued job");
                continue;
            }
            if jobs.send(entry).is_err() {
                error!("all timer workers exited; poller stopping");
                return;
            }
        }
    }
}

fn timespec(d: Duration) -> Timespec {
    Timespec {
        tv_sec: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        tv_nsec: d.subsec_nanos() as _,
    }
}

/// A timerfd registered with the pool.
pub(crate) struct NativeTimer {
    entry: Arc<Entry>,
    token: Token,
    pool: &'static TimerPool,
}

impl NativeTimer {
    /// Allocates a timer bound to `callback`. The timer starts disarmed.
    pub(crate) fn create(callback: Arc<dyn NativeCallback>) -> Result<Self, i32> {
        let pool = pool()?;

        let fd = timerfd_create(
            TimerfdClockId::Realtime,
            TimerfdFlags::NONBLOCK | TimerfdFlags::CLOEXEC,
        )
        .map_err(|e| e.raw_os_error())?;

        let token = Token(pool.next_token.fetch_add(1, Ordering::Relaxed));
        let raw_fd = fd.as_raw_fd();
        pool.registry
            .register(&mut SourceFd(&raw_fd), token, Interest::READABLE)
            .map_err(|e| e.raw_os_error().unwrap_or(-1))?;

        let entry = Arc::new(Entry {
            fd,
            callback,
            id: RawTimer::new(token.0),
            pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        lock(&pool.entries).insert(token, Arc::clone(&entry));

        debug!(timer = %entry.id, "native timer created");
        Ok(Self { entry, token, pool })
    }

    /// Arms (or with `None`, disarms) the timer.
    ///
    /// The window length is accepted for parity with the native contract;
    /// timerfd has no batching allowance.
    pub(crate) fn arm(&self, due: Option<&FileTime>, period_ms: u32, _window_length_ms: u32) {
        let (flags, value, interval) = match due.map(|d| d.decode()) {
            None => (TimerfdTimerFlags::empty(), Duration::ZERO, Duration::ZERO),
            Some(DueKind::Relative(delay)) => (
                TimerfdTimerFlags::empty(),
                delay.max(MIN_DUE),
                Duration::from_millis(u64::from(period_ms)),
            ),
            Some(DueKind::Absolute(at)) => (
                TimerfdTimerFlags::ABSTIME,
                at.max(MIN_DUE),
                Duration::from_millis(u64::from(period_ms)),
            ),
        };

        let spec = Itimerspec {
            it_interval: timespec(interval),
            it_value: timespec(value),
        };
        if let Err(_e) = timerfd_settime(&self.entry.fd, flags, &spec) {
            warn!(timer = %self.entry.id, error = %_e, "timerfd_settime failed");
            return;
        }
        trace!(
            timer = %self.entry.id,
            armed = due.is_some(),
            period_ms,
            window_length_ms = _window_length_ms,
            "native timer armed"
        );
    }

    /// Releases the timer. Callbacks already running are not waited for;
    /// queued jobs a worker has not started yet are dropped.
    pub(crate) fn close(self) {
        drop(self);
    }

    fn release(&mut self) {
        if self.entry.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stats) = self.entry.callback.stats() {
            stats.mark_released();
        }
        self.arm(None, 0, 0);

        let raw_fd = self.entry.fd.as_raw_fd();
        if let Err(_e) = self.pool.registry.deregister(&mut SourceFd(&raw_fd)) {
            warn!(timer = %self.entry.id, error = %_e, "timerfd deregister failed");
        }
        lock(&self.pool.entries).remove(&self.token);
        debug!(timer = %self.entry.id, "native timer closed");
    }
}

impl Drop for NativeTimer {
    fn drop(&mut self) {
        self.release();
    }
}
