//! Errors reported synchronously by `start_*`.
//!
//! Nothing here is ever raised by disposal, and there is no background error
//! channel: a failed start simply never produces a handle.

use std::time::SystemTime;

use thiserror::Error;

/// Error starting a timer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    /// The native timer object could not be allocated.
    ///
    /// `code` is the platform's last-error value (`GetLastError` on Windows,
    /// `errno` on Linux).
    #[error("failed to create native timer (os error {code})")]
    CreationFailed {
        /// Platform error code.
        code: i32,
    },
    /// The timer was started without a callback.
    #[error("timer started without a callback")]
    MissingCallback,
    /// The absolute due time cannot be expressed as a file time.
    #[error("due time {0:?} is outside the representable file-time range")]
    DueTimeOutOfRange(SystemTime),
}

impl TimerError {
    /// Returns the platform error code for creation failures.
    #[must_use]
    pub const fn os_code(&self) -> Option<i32> {
        match self {
            Self::CreationFailed { code } => Some(*code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TimerError {
    fn from(err: std::io::Error) -> Self {
        Self::CreationFailed {
            code: err.raw_os_error().unwrap_or(-1),
        }
    }
}
