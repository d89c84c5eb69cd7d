//! Lifecycle tests against the real native timer.
//!
//! These exercise wall-clock behaviour (periodicity, absolute arrival,
//! disposal racing callbacks), so each test runs for a few hundred
//! milliseconds.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=tptimer=trace cargo test --features tracing --test timer_lifecycle -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, Once, OnceLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tptimer::{DueTime, TimerBuilder, TimerHandle, TimerState};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        tptimer::init_tracing();
    });
}

/// Polls `done` every few milliseconds until it holds or `timeout` passes.
fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

#[derive(Default)]
struct Stamps(Mutex<Vec<Instant>>);

impl Stamps {
    fn record(&self) {
        self.0.lock().unwrap().push(Instant::now());
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn snapshot(&self) -> Vec<Instant> {
        self.0.lock().unwrap().clone()
    }
}

#[test]
fn periodic_relative_timer_end_to_end() {
    init_test_tracing();

    let stamps = Arc::new(Stamps::default());
    let timer =
        TimerHandle::start_relative(|s: &Arc<Stamps>| s.record(), Arc::clone(&stamps), 0, 100)
            .expect("start timer");
    assert_eq!(timer.state(), TimerState::Active);

    assert!(
        wait_until(Duration::from_secs(3), || stamps.len() >= 5),
        "expected five firings, saw {}",
        stamps.len()
    );
    assert!(timer.dispose_and_drain(Duration::from_secs(1)));
    assert_eq!(timer.state(), TimerState::Disposed);

    let after_dispose = stamps.snapshot();
    for (k, pair) in after_dispose.windows(2).take(4).enumerate() {
        let gap = pair[1].duration_since(pair[0]);
        assert!(
            (Duration::from_millis(90)..=Duration::from_millis(150)).contains(&gap),
            "gap {k} was {gap:?}"
        );
    }

    thread::sleep(Duration::from_millis(300));
    assert_eq!(
        stamps.len(),
        after_dispose.len(),
        "timer fired after dispose"
    );
}

#[test]
fn absolute_timer_fires_once_at_due_time() {
    init_test_tracing();

    let due = SystemTime::now() + Duration::from_millis(200);
    let fired_at = Arc::new(Mutex::new(Vec::<SystemTime>::new()));
    let timer = TimerHandle::start_absolute(
        |seen: &Arc<Mutex<Vec<SystemTime>>>| seen.lock().unwrap().push(SystemTime::now()),
        Arc::clone(&fired_at),
        due,
        0,
    )
    .expect("start timer");
    assert_eq!(timer.due(), DueTime::At(due));

    thread::sleep(Duration::from_millis(600));

    let seen = fired_at.lock().unwrap().clone();
    assert_eq!(seen.len(), 1, "one-shot timer fired {} times", seen.len());
    // Due times are truncated to 100 ns ticks.
    assert!(seen[0] + Duration::from_micros(1) >= due, "fired before due time");
    let late = seen[0].duration_since(due).unwrap_or_default();
    assert!(late < Duration::from_millis(150), "fired {late:?} late");
    assert_eq!(timer.fire_count(), 1);
}

#[test]
fn absolute_timer_disposed_before_due_never_fires() {
    init_test_tracing();

    let hits = Arc::new(AtomicUsize::new(0));
    let timer = TimerHandle::start_absolute(
        |hits: &Arc<AtomicUsize>| {
            hits.fetch_add(1, Ordering::SeqCst);
        },
        Arc::clone(&hits),
        SystemTime::now() + Duration::from_millis(150),
        50,
    )
    .expect("start timer");

    timer.dispose();
    thread::sleep(Duration::from_millis(400));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

struct SlowCallback {
    started: AtomicBool,
    finished: AtomicBool,
}

#[test]
fn dispose_during_fire_lets_callback_complete() {
    init_test_tracing();

    let ctx = Arc::new(SlowCallback {
        started: AtomicBool::new(false),
        finished: AtomicBool::new(false),
    });
    let timer = TimerHandle::start_relative(
        |ctx: &Arc<SlowCallback>| {
            ctx.started.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(200));
            ctx.finished.store(true, Ordering::SeqCst);
        },
        Arc::clone(&ctx),
        0,
        0,
    )
    .expect("start timer");

    assert!(wait_until(Duration::from_secs(2), || ctx
        .started
        .load(Ordering::SeqCst)));

    let before = Instant::now();
    timer.dispose();
    assert!(
        before.elapsed() < Duration::from_millis(100),
        "dispose blocked on the running callback"
    );
    assert_eq!(timer.in_flight(), 1);
    assert!(!ctx.finished.load(Ordering::SeqCst));

    assert!(timer.dispose_and_drain(Duration::from_secs(2)));
    assert!(ctx.finished.load(Ordering::SeqCst));
    assert_eq!(timer.fire_count(), 1);
}

#[derive(Default)]
struct SelfDisposing {
    handle: OnceLock<Arc<TimerHandle>>,
    hits: AtomicUsize,
}

#[test]
fn dispose_from_inside_callback() {
    init_test_tracing();

    let ctx = Arc::new(SelfDisposing::default());
    let timer = Arc::new(
        TimerHandle::start_relative(
            |ctx: &Arc<SelfDisposing>| {
                ctx.hits.fetch_add(1, Ordering::SeqCst);
                if let Some(handle) = ctx.handle.get() {
                    handle.dispose();
                }
            },
            Arc::clone(&ctx),
            50,
            20,
        )
        .expect("start timer"),
    );
    assert!(ctx.handle.set(Arc::clone(&timer)).is_ok());

    assert!(wait_until(Duration::from_secs(2), || !timer.is_active()));
    let hits = ctx.hits.load(Ordering::SeqCst);
    assert!(hits >= 1);

    thread::sleep(Duration::from_millis(150));
    assert_eq!(ctx.hits.load(Ordering::SeqCst), hits);
    assert_eq!(timer.state(), TimerState::Disposed);
}

#[test]
fn racing_dispose_and_drop_release_once() {
    init_test_tracing();

    let token = Arc::new(());
    for _ in 0..50 {
        let timer = Arc::new(
            TimerHandle::start_relative(|_: &Arc<()>| {}, Arc::clone(&token), 0, 1)
                .expect("start timer"),
        );
        let barrier = Arc::new(Barrier::new(2));

        let racer = {
            let timer = Arc::clone(&timer);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                timer.dispose();
            })
        };
        barrier.wait();
        drop(timer);
        racer.join().unwrap();
    }

    assert!(
        wait_until(Duration::from_secs(2), || Arc::strong_count(&token) == 1),
        "callback contexts leaked: {} references left",
        Arc::strong_count(&token)
    );
}

#[derive(Default)]
struct DrainFromCallback {
    handle: OnceLock<Arc<TimerHandle>>,
    drained: OnceLock<bool>,
}

#[test]
fn drain_from_inside_callback_reports_false() {
    init_test_tracing();

    let ctx = Arc::new(DrainFromCallback::default());
    let timer = Arc::new(
        TimerHandle::start_relative(
            |ctx: &Arc<DrainFromCallback>| {
                if let Some(handle) = ctx.handle.get() {
                    let _ = ctx
                        .drained
                        .set(handle.dispose_and_drain(Duration::from_millis(50)));
                }
            },
            Arc::clone(&ctx),
            50,
            20,
        )
        .expect("start timer"),
    );
    assert!(ctx.handle.set(Arc::clone(&timer)).is_ok());

    assert!(wait_until(Duration::from_secs(2), || ctx.drained.get().is_some()));
    assert_eq!(ctx.drained.get(), Some(&false));
    assert_eq!(timer.state(), TimerState::Disposed);
    assert!(timer.dispose_and_drain(Duration::from_secs(1)));
}

#[test]
fn slow_timer_does_not_stretch_other_periods() {
    init_test_tracing();

    let slow = TimerHandle::start_relative(
        |_: &()| thread::sleep(Duration::from_millis(20)),
        (),
        0,
        1,
    )
    .expect("start slow timer");

    let stamps = Arc::new(Stamps::default());
    let steady =
        TimerHandle::start_relative(|s: &Arc<Stamps>| s.record(), Arc::clone(&stamps), 0, 100)
            .expect("start steady timer");

    thread::sleep(Duration::from_secs(1));
    assert!(steady.dispose_and_drain(Duration::from_secs(1)));
    assert!(slow.dispose_and_drain(Duration::from_secs(1)));

    let seen = stamps.snapshot();
    assert!(seen.len() >= 8, "steady timer fired {} times in 1s", seen.len());
    for (k, pair) in seen.windows(2).enumerate() {
        let gap = pair[1].duration_since(pair[0]);
        assert!(gap <= Duration::from_millis(150), "gap {k} was {gap:?}");
    }
}

#[derive(Default)]
struct Overlap {
    running: AtomicUsize,
    peak: AtomicUsize,
}

#[test]
fn slow_callbacks_may_overlap() {
    init_test_tracing();

    let ctx = Arc::new(Overlap::default());
    let timer = TimerHandle::start_relative(
        |ctx: &Arc<Overlap>| {
            let now = ctx.running.fetch_add(1, Ordering::SeqCst) + 1;
            ctx.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(60));
            ctx.running.fetch_sub(1, Ordering::SeqCst);
        },
        Arc::clone(&ctx),
        0,
        10,
    )
    .expect("start timer");

    let overlapped = wait_until(Duration::from_secs(2), || {
        ctx.peak.load(Ordering::SeqCst) >= 2
    });
    assert!(timer.dispose_and_drain(Duration::from_secs(2)));
    assert!(overlapped, "firings never overlapped");
}

#[test]
fn builder_window_length_still_fires() {
    init_test_tracing();

    let hits = Arc::new(AtomicUsize::new(0));
    let timer = TimerBuilder::new(Arc::clone(&hits))
        .callback(|hits: &Arc<AtomicUsize>| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
        .due(DueTime::After(20))
        .window_length_ms(10)
        .start()
        .expect("start timer");

    assert!(wait_until(Duration::from_secs(2), || {
        hits.load(Ordering::SeqCst) == 1
    }));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    drop(timer);
}
