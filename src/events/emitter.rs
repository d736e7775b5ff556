//! Event emitter abstraction decoupling components from transport.
//!
//! Channels and receivers depend on the [`EventEmitter`] trait rather than
//! a concrete broadcast channel, enabling testing and alternative delivery.

use super::{PlaybackEvent, ReceiverEvent};

/// Trait for emitting domain events without knowledge of transport.
pub trait EventEmitter: Send + Sync {
    /// Emits a playback lifecycle event.
    fn emit_playback(&self, event: PlaybackEvent);

    /// Emits a receiver membership/state event.
    fn emit_receiver(&self, event: ReceiverEvent);
}

/// No-op emitter for embedding without an event consumer, and for tests.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_playback(&self, _event: PlaybackEvent) {
        // No-op
    }

    fn emit_receiver(&self, _event: ReceiverEvent) {
        // No-op
    }
}

/// Logging emitter for debugging and development.
///
/// Logs all events at debug level.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit_playback(&self, event: PlaybackEvent) {
        tracing::debug!(?event, "playback_event");
    }

    fn emit_receiver(&self, event: ReceiverEvent) {
        tracing::debug!(?event, "receiver_event");
    }
}
