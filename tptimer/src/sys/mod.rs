//! Native thread-pool timer primitive.
//!
//! Exactly one backend is compiled in. Each exposes the same shape:
//!
//! ```text
//! NativeTimer::create(callback) -> Result<NativeTimer, os error code>
//! NativeTimer::arm(&self, due: Option<&FileTime>, period_ms, window_length_ms)
//! NativeTimer::close(self)
//! ```
//!
//! `arm(None, ..)` stops future firings without releasing the object.
//! `close` never waits for a running callback. Dropping a `NativeTimer`
//! closes it.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use linux::NativeTimer;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::NativeTimer;

#[cfg(not(any(target_os = "linux", target_os = "android", windows)))]
compile_error!("tptimer needs a thread-pool timer backend: Windows or Linux/Android");
