//! Due-time encoding for the native timer.
//!
//! The native primitive takes a single signed count of 100 ns ticks:
//!
//! ```text
//! ticks >= 0   absolute: ticks since 1601-01-01T00:00:00Z (wall clock)
//! ticks <  0   relative: wait |ticks| from now
//! ```
//!
//! A relative delay of `d` milliseconds encodes as `-(1 + d * TICKS_PER_MS)`,
//! so a zero delay is `-1`, "as soon as possible".

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::TimerError;

/// Ticks per millisecond.
pub const TICKS_PER_MS: i64 = 10_000;

/// Nanoseconds per tick.
pub const NANOS_PER_TICK: u64 = 100;

const TICKS_PER_SEC: u64 = 10_000_000;

/// Ticks between the file-time epoch (1601) and the Unix epoch (1970).
pub const UNIX_EPOCH_TICKS: i64 = 116_444_736_000_000_000;

/// Encoded due time, as handed to the native primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FileTime(i64);

/// What a [`FileTime`] means once decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueKind {
    /// Fire at this offset from the Unix epoch. Instants before 1970 decode
    /// to [`Duration::ZERO`], which is already due.
    Absolute(Duration),
    /// Fire this long after arming.
    Relative(Duration),
}

impl FileTime {
    /// Relative due time meaning "as soon as possible".
    pub const ASAP: Self = Self(-1);

    /// Wraps a raw tick count.
    #[inline]
    #[must_use]
    pub const fn from_ticks(ticks: i64) -> Self {
        Self(ticks)
    }

    /// Returns the raw tick count.
    #[inline]
    #[must_use]
    pub const fn ticks(self) -> i64 {
        self.0
    }

    /// Encodes a delay relative to the moment the timer is armed.
    ///
    /// Total over `u32`: the largest delay is about 4.3e13 ticks.
    #[inline]
    #[must_use]
    pub const fn relative(delay_ms: u32) -> Self {
        Self(-1 - delay_ms as i64 * TICKS_PER_MS)
    }

    /// Encodes a wall-clock instant.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::DueTimeOutOfRange`] for instants before
    /// 1601-01-01 or past the `i64` tick range.
    pub fn absolute(at: SystemTime) -> Result<Self, TimerError> {
        let out_of_range = || TimerError::DueTimeOutOfRange(at);
        let ticks = match at.duration_since(UNIX_EPOCH) {
            Ok(after) => i64::try_from(duration_to_ticks(after))
                .ok()
                .and_then(|t| UNIX_EPOCH_TICKS.checked_add(t)),
            Err(before) => i64::try_from(duration_to_ticks(before.duration()))
                .ok()
                .map(|t| UNIX_EPOCH_TICKS - t),
        }
        .ok_or_else(out_of_range)?;

        if ticks < 0 {
            return Err(out_of_range());
        }
        Ok(Self(ticks))
    }

    /// Returns `true` for relative due times.
    #[inline]
    #[must_use]
    pub const fn is_relative(self) -> bool {
        self.0 < 0
    }

    /// Low 32 bits, the `dwLowDateTime` half of a native `FILETIME`.
    #[inline]
    #[must_use]
    pub const fn low_part(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// High 32 bits, the `dwHighDateTime` half of a native `FILETIME`.
    #[inline]
    #[must_use]
    pub const fn high_part(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Decodes into a kind-tagged duration.
    #[must_use]
    pub fn decode(self) -> DueKind {
        if self.is_relative() {
            DueKind::Relative(ticks_to_duration(self.0.unsigned_abs()))
        } else {
            let since_unix = self.0.saturating_sub(UNIX_EPOCH_TICKS).max(0);
            DueKind::Absolute(ticks_to_duration(since_unix.unsigned_abs()))
        }
    }
}

/// When a timer should first fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueTime {
    /// At a wall-clock instant.
    At(SystemTime),
    /// After a delay in milliseconds.
    After(u32),
}

impl DueTime {
    /// Encodes into the native representation.
    ///
    /// # Errors
    ///
    /// See [`FileTime::absolute`].
    pub fn encode(self) -> Result<FileTime, TimerError> {
        match self {
            Self::At(at) => FileTime::absolute(at),
            Self::After(delay_ms) => Ok(FileTime::relative(delay_ms)),
        }
    }
}

impl Default for DueTime {
    fn default() -> Self {
        Self::After(0)
    }
}

impl From<SystemTime> for DueTime {
    fn from(at: SystemTime) -> Self {
        Self::At(at)
    }
}

// Sub-tick remainders are truncated.
fn duration_to_ticks(d: Duration) -> u128 {
    d.as_nanos() / u128::from(NANOS_PER_TICK)
}

fn ticks_to_duration(ticks: u64) -> Duration {
    let secs = ticks / TICKS_PER_SEC;
    let nanos = (ticks % TICKS_PER_SEC) * NANOS_PER_TICK;
    // nanos < 1e9 by construction
    Duration::new(secs, nanos as u32)
}
