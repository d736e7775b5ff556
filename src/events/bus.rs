//! Broadcast fan-out of domain events to external subscribers.
//!
//! The [`EventBus`] sits at the boundary between the core and whatever
//! pushes UI updates. It implements [`EventEmitter`] by forwarding typed
//! events into a `tokio::sync::broadcast` channel that subscribers drain.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::emitter::EventEmitter;
use super::{BusEvent, PlaybackEvent, ReceiverEvent};
use crate::protocol_constants::EVENT_CHANNEL_CAPACITY;

/// Multi-producer event fan-out over a broadcast channel.
///
/// Subscribers that fall behind lose the oldest events (broadcast channel
/// semantics); the core never blocks on slow consumers. `default()` sizes
/// the channel at [`EVENT_CHANNEL_CAPACITY`].
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
    /// Optional secondary emitter for platform-specific delivery.
    external_emitter: Option<Arc<dyn EventEmitter>>,
}

impl EventBus {
    /// Creates a bus with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            external_emitter: None,
        }
    }

    /// Adds an external emitter that observes every event in addition to
    /// the broadcast subscribers.
    #[must_use]
    pub fn with_external_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.external_emitter = Some(emitter);
        self
    }

    /// Returns a new receiver for the broadcast channel.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: BusEvent) {
        if let Err(e) = self.tx.send(event) {
            log::trace!("[EventBus] No subscribers: {}", e);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventEmitter for EventBus {
    fn emit_playback(&self, event: PlaybackEvent) {
        if let Some(ref emitter) = self.external_emitter {
            emitter.emit_playback(event.clone());
        }
        self.publish(BusEvent::Playback(event));
    }

    fn emit_receiver(&self, event: ReceiverEvent) {
        if let Some(ref emitter) = self.external_emitter {
            emitter.emit_receiver(event.clone());
        }
        self.publish(BusEvent::Receiver(event));
    }
}
