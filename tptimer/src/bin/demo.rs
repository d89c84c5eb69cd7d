//! Thread-pool timer demo.
//!
//! Starts one periodic relative timer, prints on every firing and records
//! the time spent in each callback. Press Enter (or close stdin) to dispose
//! the timer and exit.
//!
//! # Usage
//!
//! ```sh
//! tptimer-demo --period 250 --delay 0
//! ```

use std::io::{self, BufRead};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use minstant::Instant;

use tptimer::{PoolConfig, TimerBuilder, TimerError, configure_pool};

/// Default timer period in milliseconds.
const DEFAULT_PERIOD_MS: u32 = 1000;

/// How long `dispose_and_drain` waits on exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Error running the demo.
#[derive(Debug, thiserror::Error)]
enum DemoError {
    /// Bad command line.
    #[error("{0}")]
    Usage(String),
    /// The timer could not be started.
    #[error(transparent)]
    Timer(#[from] TimerError),
    /// Reading stdin failed.
    #[error("failed to read stdin: {0}")]
    Stdin(#[from] io::Error),
}

/// Parsed command line.
#[derive(Debug)]
struct DemoConfig {
    period_ms: u32,
    delay_ms: u32,
    window_ms: u32,
    workers: Option<usize>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            period_ms: DEFAULT_PERIOD_MS,
            delay_ms: 0,
            window_ms: 0,
            workers: None,
        }
    }
}

/// Per-firing timestamps, taken on entry and exit of the callback.
#[derive(Default)]
struct TimerContext {
    pre: Mutex<Vec<Instant>>,
    post: Mutex<Vec<Instant>>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("tptimer-demo: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), DemoError> {
    let args: Vec<String> = std::env::args().collect();
    let config = parse_args(&args)?;

    tptimer::init_tracing();

    if let Some(workers) = config.workers {
        // Nothing has started a timer yet, so this cannot be rejected.
        let _ = configure_pool(PoolConfig {
            workers,
            ..PoolConfig::default()
        });
    }

    println!(
        "Timer evaluation in Rust\n OS: {} ({})\n Crate: tptimer {}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        env!("CARGO_PKG_VERSION"),
    );
    println!(
        "Timer starts with period (ms): {}\nPress Enter to exit",
        config.period_ms
    );

    let context = Arc::new(TimerContext::default());
    let started = Instant::now();
    let timer = TimerBuilder::new(Arc::clone(&context))
        .callback(|ctx: &Arc<TimerContext>| on_tick(ctx))
        .due(tptimer::DueTime::After(config.delay_ms))
        .period_ms(config.period_ms)
        .window_length_ms(config.window_ms)
        .start()?;

    let stdin = io::stdin();
    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;

    let drained = timer.dispose_and_drain(DRAIN_TIMEOUT);
    println!(
        "fired {} time(s) in {:.1?}{}",
        timer.fire_count(),
        started.elapsed(),
        if drained { "" } else { " (callback still running)" }
    );
    context.report();
    println!("done");
    Ok(())
}

impl TimerContext {
    /// Prints the mean gap between firings and the mean callback duration.
    fn report(&self) {
        let pre = self.pre.lock().unwrap_or_else(PoisonError::into_inner);
        let post = self.post.lock().unwrap_or_else(PoisonError::into_inner);

        let gaps: Vec<Duration> = pre.windows(2).map(|w| w[1].duration_since(w[0])).collect();
        if let Some(mean) = mean(&gaps) {
            println!("mean period: {mean:.2?} over {} gap(s)", gaps.len());
        }

        let busy: Vec<Duration> = pre
            .iter()
            .zip(post.iter())
            .map(|(a, b)| b.duration_since(*a))
            .collect();
        if let Some(mean) = mean(&busy) {
            println!("mean callback time: {mean:.2?}");
        }
    }
}

fn mean(samples: &[Duration]) -> Option<Duration> {
    let n = u32::try_from(samples.len()).ok().filter(|n| *n > 0)?;
    Some(samples.iter().sum::<Duration>() / n)
}

fn on_tick(ctx: &TimerContext) {
    ctx.pre
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(Instant::now());
    println!("do something");
    ctx.post
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(Instant::now());
}

/// Parses command line arguments into a `DemoConfig`.
fn parse_args(args: &[String]) -> Result<DemoConfig, DemoError> {
    let mut config = DemoConfig::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--period" | "-p" => config.period_ms = parse_value(args, &mut i, flag)?,
            "--delay" | "-d" => config.delay_ms = parse_value(args, &mut i, flag)?,
            "--window" | "-w" => config.window_ms = parse_value(args, &mut i, flag)?,
            "--workers" | "-n" => config.workers = Some(parse_value(args, &mut i, flag)?),
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(DemoError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    Ok(config)
}

fn parse_value<T: std::str::FromStr>(
    args: &[String],
    i: &mut usize,
    flag: &str,
) -> Result<T, DemoError>
where
    T::Err: std::fmt::Display,
{
    *i += 1;
    let raw = args
        .get(*i)
        .ok_or_else(|| DemoError::Usage(format!("missing value for {flag}")))?;
    raw.parse()
        .map_err(|e| DemoError::Usage(format!("invalid value for {flag}: {raw} ({e})")))
}

fn print_usage() {
    eprintln!(
        r#"tptimer-demo - periodic thread-pool timer demo

USAGE:
    tptimer-demo [OPTIONS]

OPTIONS:
    -p, --period <MS>    Timer period in milliseconds (default: 1000)
    -d, --delay <MS>     Initial delay in milliseconds (default: 0)
    -w, --window <MS>    Batching window in milliseconds (default: 0)
    -n, --workers <N>    Callback worker threads (Linux only)
    -h, --help           Print this help message

Press Enter to dispose the timer and exit.
"#
    );
}
