//! Fixed protocol constants that should NOT be changed.
//!
//! These values are part of the wire protocol and the playback timing
//! contract between the broadcaster and its receivers; changing them breaks
//! interoperability with deployed receivers.

// ─────────────────────────────────────────────────────────────────────────────
// Audio Geometry
// ─────────────────────────────────────────────────────────────────────────────

/// Default audio sample rate (Hz).
///
/// 44.1kHz matches the CD-audio sources the playback system serves.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Default number of audio channels (stereo).
pub const DEFAULT_CHANNELS: u16 = 2;

/// Bytes per sample: signed 16-bit little-endian PCM.
pub const BYTES_PER_SAMPLE: u16 = 2;

/// Default samples per frame (per channel).
///
/// 882 samples at 44.1kHz is exactly 20ms, which keeps the stream interval
/// an integer number of microseconds.
pub const DEFAULT_FRAME_SAMPLES: u32 = 882;

// ─────────────────────────────────────────────────────────────────────────────
// Scheduling
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed headroom added on top of the worst receiver latency (µs).
///
/// Every playback timestamp is at least this far in the future when the
/// packet leaves the scheduler, so receivers always have buffering room.
pub const BUFFER_LATENCY_US: u64 = 50_000;

/// Divisor applied to the stream interval during buffer fast-fill and for
/// the controller tick.
///
/// Emitting at 4x real time packs the receiver buffer before the first
/// playback deadline; steady state then matches real time exactly.
pub const BUFFER_EMIT_DIVISOR: u64 = 4;

/// Default number of frames pushed during buffer fast-fill.
///
/// 32 frames at 20ms/frame is 640ms of audio. After fast-fill the steady
/// in-flight window settles at three quarters of that plus the latency
/// budget, which keeps at least half a second of audio in flight.
pub const DEFAULT_BUFFER_SIZE: usize = 32;

/// Consecutive source read failures tolerated before the stream advances
/// to the next source. Failed reads are played as silence.
pub const SOURCE_ERROR_LIMIT: u32 = 4;

/// Source progress events are published every this many controller ticks.
pub const PROGRESS_TICK_MULTIPLE: u64 = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Time Sync
// ─────────────────────────────────────────────────────────────────────────────

/// Samples collected per sync round before an estimate is produced.
pub const SYNC_SAMPLE_COUNT: usize = 11;

/// Round-trip ceiling (µs); samples above it are dropped outright.
pub const SYNC_RTT_CEILING_US: u64 = 1_000_000;

/// Interval between periodic sync rounds while a receiver is online (seconds).
pub const SYNC_INTERVAL_SECS: u64 = 30;

/// A receiver missing sync for this many intervals is marked offline.
pub const SYNC_OFFLINE_MULTIPLIER: u64 = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Wire Format
// ─────────────────────────────────────────────────────────────────────────────

/// Length of a control opcode on the wire (4 ASCII bytes).
pub const OPCODE_LEN: usize = 4;

/// Length of a wire timestamp (i64 big-endian µs).
pub const TIMESTAMP_LEN: usize = 8;

/// Maximum accepted control frame length (bytes).
///
/// The largest legitimate frame is a sync response at 28 bytes; anything
/// bigger is a protocol violation and drops the connection.
pub const MAX_CONTROL_FRAME_LEN: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Event Bus
// ─────────────────────────────────────────────────────────────────────────────

/// Capacity of the event broadcast channel for external subscribers.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;
