//! Process-wide monotonic time source.
//!
//! All playback and emission timestamps in the core are microseconds on
//! this clock. It is anchored to an arbitrary process epoch and is immune
//! to wall-clock adjustments. Building on `tokio::time::Instant` keeps the
//! clock coherent with the paused-time test runtime.

use std::time::Duration;

use tokio::time::Instant;

/// Monotonic microsecond clock shared by every component in the process.
///
/// Cloning is cheap; all clones share the same epoch.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    /// Creates a clock anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Microseconds elapsed since the process epoch. Strictly non-decreasing.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Maps a clock timestamp back to an [`Instant`], for timer arming.
    #[must_use]
    pub fn instant_at(&self, at_us: u64) -> Instant {
        self.epoch + Duration::from_micros(at_us)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
