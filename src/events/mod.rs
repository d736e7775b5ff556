//! Event system for external subscribers.
//!
//! This module provides:
//! - [`EventEmitter`] trait for domain components to emit events
//! - Event types for playback and receiver domains
//!
//! Transport of events to UIs (WebSocket, desktop frontend, ...) lives
//! outside this crate; the [`EventBus`] broadcast channel is the boundary.

mod bus;
mod emitter;

pub use bus::EventBus;
pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

/// Events broadcast to external subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum BusEvent {
    /// Events from channel playback lifecycles.
    Playback(PlaybackEvent),

    /// Events about receiver membership and state.
    Receiver(ReceiverEvent),
}

/// Playback status carried by play/pause events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackStatus {
    /// The channel is emitting packets.
    Playing,
    /// The channel is stopped with its position preserved.
    Paused,
}

/// Target of a volume change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeTarget {
    /// Master volume of a channel.
    Channel,
    /// Volume of a single receiver.
    Receiver,
}

/// Events from channel playback lifecycles.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlaybackEvent {
    /// Playback was started or paused.
    PlayPause {
        /// The channel that changed state.
        #[serde(rename = "channelId")]
        channel_id: String,
        /// New playback status.
        status: PlaybackStatus,
    },
    /// The channel ran out of sources and returned to stop.
    Finished {
        /// The channel that finished.
        #[serde(rename = "channelId")]
        channel_id: String,
    },
    /// Playback crossed into a new source.
    SourceChanged {
        /// The channel playing the source.
        #[serde(rename = "channelId")]
        channel_id: String,
        /// Id of the source now playing.
        #[serde(rename = "newSourceId")]
        new_source_id: String,
    },
    /// Periodic progress through the current source.
    SourceProgress {
        /// The channel playing the source.
        #[serde(rename = "channelId")]
        channel_id: String,
        /// Id of the source in progress.
        #[serde(rename = "sourceId")]
        source_id: String,
        /// Milliseconds played of this source.
        #[serde(rename = "progressMs")]
        progress_ms: u64,
        /// Total source duration in milliseconds (0 when unknown).
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
}

/// Events about receiver membership and state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReceiverEvent {
    /// A receiver joined a channel.
    Added {
        /// The channel joined.
        #[serde(rename = "channelId")]
        channel_id: String,
        /// The receiver that joined.
        #[serde(rename = "receiverId")]
        receiver_id: String,
    },
    /// A receiver left a channel.
    Removed {
        /// The channel left.
        #[serde(rename = "channelId")]
        channel_id: String,
        /// The receiver that left.
        #[serde(rename = "receiverId")]
        receiver_id: String,
    },
    /// A channel or receiver volume changed.
    VolumeChanged {
        /// Id of the channel or receiver.
        id: String,
        /// What the volume applies to.
        target: VolumeTarget,
        /// New volume in [0.0, 1.0].
        volume: f32,
    },
    /// A receiver came back online (sync resumed).
    Online {
        /// The receiver that recovered.
        #[serde(rename = "receiverId")]
        receiver_id: String,
    },
    /// A receiver went offline (transport failure or missed sync).
    Offline {
        /// The receiver that went dark.
        #[serde(rename = "receiverId")]
        receiver_id: String,
    },
}

impl From<PlaybackEvent> for BusEvent {
    fn from(event: PlaybackEvent) -> Self {
        BusEvent::Playback(event)
    }
}

impl From<ReceiverEvent> for BusEvent {
    fn from(event: ReceiverEvent) -> Self {
        BusEvent::Receiver(event)
    }
}
