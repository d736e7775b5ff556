//! Unison Core - synchronized multi-receiver audio broadcasting.
//!
//! This crate is the playback core of a distributed music system: a
//! logical playback group (a channel) drives one or more network-attached
//! speakers (receivers) so that every receiver renders the same PCM sample
//! at the same instant, despite variable network delay and independent
//! local clocks.
//!
//! # Architecture
//!
//! - [`clock`]: process-wide monotonic microsecond time source
//! - [`channel`]: the playback group state machine (play/pause/skip,
//!   receiver membership, coordinated shutdown)
//! - [`broadcaster`]: the packet scheduler (timestamped paced emission,
//!   in-flight window, late-join catch-up)
//! - [`emit`]: timed wire delivery to receiver transports
//! - [`source`]: fixed-step PCM frame streams over a playlist
//! - [`receiver`]: channel-side receiver state and the time-sync protocol
//! - [`controller`]: the single tick loop driving all broadcasters
//! - [`registry`]: id-keyed channel handles and receiver ownership
//! - [`events`]: typed domain events for external subscribers
//! - [`protocol`]: wire formats (audio packets, sync, control opcodes)
//! - [`store`]: boundary to the external persistence layer
//! - [`error`]: centralized error types
//!
//! # Abstraction Traits
//!
//! Core logic is decoupled from the environment through a few seams:
//!
//! - [`Transport`](transport::Transport): per-receiver wire delivery
//! - [`Emitter`](emit::Emitter): timed packet scheduling
//! - [`Source`](source::Source): PCM decode boundary
//! - [`EventEmitter`](events::EventEmitter): domain event delivery
//! - [`StateStore`](store::StateStore): playlist/volume persistence

#![warn(clippy::all)]

pub mod broadcaster;
pub mod channel;
pub mod clock;
pub mod config;
pub mod controller;
pub mod emit;
pub mod error;
pub mod events;
pub mod protocol;
pub mod protocol_constants;
pub mod receiver;
pub mod registry;
pub mod source;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types at the crate root
pub use broadcaster::{
    Broadcaster, BroadcasterNotice, BroadcasterState, InFlightPacket, StopReason,
};
pub use channel::{Channel, ChannelHandle, ChannelSnapshot, ChannelState};
pub use clock::MonotonicClock;
pub use config::{StreamConfig, SyncConfig};
pub use controller::Controller;
pub use emit::{EmitHandle, Emitter, TimestampedPacket, TransportEmitter, TransportNotice};
pub use error::{CoreError, CoreResult};
pub use events::{
    BusEvent, EventBus, EventEmitter, LoggingEventEmitter, NoopEventEmitter, PlaybackEvent,
    PlaybackStatus, ReceiverEvent, VolumeTarget,
};
pub use receiver::sync::{
    serve_sync, spawn_sync_runner, SyncEstimate, SyncEstimator, SyncExchange, SyncResponder,
    SyncSample,
};
pub use receiver::{Receiver, ReceiverId, ReceiverStatus};
pub use registry::{ChannelId, Registry};
pub use source::{Frame, MemorySource, Source, SourceId, SourceStream, StreamFrame};
pub use store::{MemoryStore, StateStore};
pub use transport::{ChannelTransport, TcpTransport, Transport};
