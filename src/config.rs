//! Stream and sync configuration.
//!
//! All timing in the core derives from [`StreamConfig`]: the stream
//! interval (real-time duration of one frame), the frame byte size, and
//! the latency budget all come from the audio geometry configured here.

use serde::{Deserialize, Serialize};

use crate::protocol_constants::{
    BUFFER_EMIT_DIVISOR, BUFFER_LATENCY_US, BYTES_PER_SAMPLE, DEFAULT_BUFFER_SIZE,
    DEFAULT_CHANNELS, DEFAULT_FRAME_SAMPLES, DEFAULT_SAMPLE_RATE, SOURCE_ERROR_LIMIT,
    SYNC_INTERVAL_SECS, SYNC_OFFLINE_MULTIPLIER, SYNC_RTT_CEILING_US, SYNC_SAMPLE_COUNT,
};

/// Audio geometry and scheduling configuration for one process.
///
/// The frame size is uniform for the whole system: every packet on the wire
/// carries exactly [`StreamConfig::bytes_per_step`] bytes of PCM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// PCM sample rate (Hz).
    pub sample_rate: u32,
    /// Channel count (interleaved).
    pub channels: u16,
    /// Bytes per sample (2 = s16le).
    pub bytes_per_sample: u16,
    /// Samples per frame, per channel.
    pub frame_samples: u32,
    /// Fixed headroom added to the worst receiver latency (µs).
    pub buffer_latency_us: u64,
    /// Frames emitted during fast-fill at broadcaster start.
    pub buffer_size: usize,
    /// Consecutive source read failures before advancing to the next source.
    pub source_error_limit: u32,
}

impl StreamConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first invalid field.
    pub fn new(
        sample_rate: u32,
        channels: u16,
        bytes_per_sample: u16,
        frame_samples: u32,
        buffer_latency_us: u64,
        buffer_size: usize,
    ) -> Result<Self, String> {
        let config = Self {
            sample_rate,
            channels,
            bytes_per_sample,
            frame_samples,
            buffer_latency_us,
            buffer_size,
            source_error_limit: SOURCE_ERROR_LIMIT,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate == 0 {
            return Err("sample_rate must be >= 1".to_string());
        }
        if self.channels == 0 {
            return Err("channels must be >= 1".to_string());
        }
        if self.bytes_per_sample == 0 {
            return Err("bytes_per_sample must be >= 1".to_string());
        }
        if self.frame_samples == 0 {
            return Err("frame_samples must be >= 1".to_string());
        }
        if self.buffer_size == 0 {
            return Err("buffer_size must be >= 1".to_string());
        }
        if self.source_error_limit == 0 {
            return Err("source_error_limit must be >= 1".to_string());
        }
        if self.stream_interval_us() == 0 {
            return Err("frame_samples / sample_rate rounds to a zero-length interval".to_string());
        }
        Ok(())
    }

    /// Real-time duration of one frame (µs).
    #[must_use]
    pub fn stream_interval_us(&self) -> u64 {
        (self.frame_samples as u64) * 1_000_000 / (self.sample_rate as u64)
    }

    /// Size of one frame on the wire (bytes of PCM payload).
    #[must_use]
    pub fn bytes_per_step(&self) -> usize {
        self.frame_samples as usize * self.channels as usize * self.bytes_per_sample as usize
    }

    /// PCM byte rate (bytes per second), used for progress/duration math.
    #[must_use]
    pub fn byte_rate(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * self.bytes_per_sample as u64
    }

    /// Controller tick interval: the stream interval divided by the
    /// fast-fill divisor.
    #[must_use]
    pub fn tick_interval_us(&self) -> u64 {
        (self.stream_interval_us() / BUFFER_EMIT_DIVISOR).max(1)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            bytes_per_sample: BYTES_PER_SAMPLE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            buffer_latency_us: BUFFER_LATENCY_US,
            buffer_size: DEFAULT_BUFFER_SIZE,
            source_error_limit: SOURCE_ERROR_LIMIT,
        }
    }
}

/// Time-sync tuning for receivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Samples collected per sync round.
    pub sample_count: usize,
    /// Round-trip ceiling (µs); slower samples are dropped.
    pub rtt_ceiling_us: u64,
    /// Interval between sync rounds while online (seconds).
    pub interval_secs: u64,
    /// Mark a receiver offline after this many missed intervals.
    pub offline_multiplier: u64,
}

impl SyncConfig {
    /// Time without a sync report after which a receiver counts as offline (µs).
    #[must_use]
    pub fn offline_after_us(&self) -> u64 {
        self.interval_secs * 1_000_000 * self.offline_multiplier
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sample_count: SYNC_SAMPLE_COUNT,
            rtt_ceiling_us: SYNC_RTT_CEILING_US,
            interval_secs: SYNC_INTERVAL_SECS,
            offline_multiplier: SYNC_OFFLINE_MULTIPLIER,
        }
    }
}
