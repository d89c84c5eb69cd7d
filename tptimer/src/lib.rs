//! Disposable thread-pool timers.
//!
//! A [`TimerHandle`] schedules a callback on the platform thread pool, first
//! at an absolute wall-clock instant or after a relative delay, then
//! periodically. The native timer object is released exactly once, whether
//! by [`TimerHandle::dispose`], by `Drop`, or by both racing each other and
//! an in-flight callback.
//!
//! - `time`: due-time encoding (100 ns ticks, sign selects absolute/relative).
//! - `callback`: adapter from the native callback shape to `callback(&context)`.
//! - `timer`: the handle, its builder and the disposal protocol.
//! - `config`: pool sizing.
//! - `sys`: the native primitive (Windows thread pool, or timerfd + mio on Linux).

pub mod callback;
pub mod config;
pub mod error;
mod sys;
pub mod time;
pub mod timer;
mod trace;

pub use config::{PoolConfig, configure_pool};
pub use error::TimerError;
pub use time::{DueTime, FileTime, TICKS_PER_MS};
pub use timer::{TimerBuilder, TimerHandle, TimerState};
pub use trace::init_tracing;
