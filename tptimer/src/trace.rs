//! Logging for timer lifecycle and pool events.
//!
//! Build with `--features tracing` to get output. Without the feature every
//! macro below expands to nothing, so callbacks pay no logging cost.

/// Default directive used when `RUST_LOG` is unset.
#[cfg(feature = "tracing")]
const DEFAULT_DIRECTIVE: &str = "tptimer=debug";

/// Installs a global subscriber that prints timer and pool events.
///
/// Returns `false` if a subscriber was already installed (for example by a
/// previous test) or if the `tracing` feature is off.
#[cfg(feature = "tracing")]
pub fn init_tracing() -> bool {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init()
        .is_ok()
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() -> bool {
    false
}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

// One no-op body for every level. Arguments are never evaluated.
#[cfg(not(feature = "tracing"))]
macro_rules! log_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use log_noop as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use log_noop as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use log_noop as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use log_noop as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use log_noop as warn;
