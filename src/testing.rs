//! Shared test doubles.
//!
//! The loopback emitter records every scheduling decision instead of
//! touching a transport, so scheduler tests can assert on exact emit
//! times, playback timestamps and discards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::emit::{EmitHandle, Emitter, TimestampedPacket};
use crate::receiver::ReceiverId;
use crate::transport::Transport;

/// One broadcast emission captured by the loopback emitter.
#[derive(Debug, Clone)]
pub struct EmittedRecord {
    /// Scheduled wire time.
    pub emit_at: u64,
    /// The packet as handed to the emitter.
    pub packet: TimestampedPacket,
    /// Emitter-assigned sequence number (matches the broadcaster's packet
    /// numbering when nothing else emits).
    pub packet_number_hint: u64,
}

/// One targeted (catch-up) emission captured by the loopback emitter.
#[derive(Debug, Clone)]
pub struct TargetedRecord {
    /// The receiver singled out.
    pub receiver_id: ReceiverId,
    /// Scheduled wire time.
    pub emit_at: u64,
    /// The packet as handed to the emitter.
    pub packet: TimestampedPacket,
}

/// Recording [`Emitter`] for scheduler tests. Nothing is delivered.
pub struct LoopbackEmitter {
    emitted: Mutex<Vec<EmittedRecord>>,
    targeted: Mutex<Vec<TargetedRecord>>,
    discarded: Mutex<Vec<(EmitHandle, u64)>>,
    seq: AtomicU64,
}

impl LoopbackEmitter {
    /// Creates a fresh recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            emitted: Mutex::new(Vec::new()),
            targeted: Mutex::new(Vec::new()),
            discarded: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        })
    }

    /// Broadcast emissions, oldest first.
    pub fn emitted(&self) -> Vec<EmittedRecord> {
        self.emitted.lock().clone()
    }

    /// Targeted emissions, oldest first.
    pub fn targeted(&self) -> Vec<TargetedRecord> {
        self.targeted.lock().clone()
    }

    /// Discards observed, oldest first.
    pub fn discarded(&self) -> Vec<(EmitHandle, u64)> {
        self.discarded.lock().clone()
    }

    /// Forgets all recordings. Sequence numbers keep counting.
    pub fn clear(&self) {
        self.emitted.lock().clear();
        self.targeted.lock().clear();
        self.discarded.lock().clear();
    }
}

impl Emitter for LoopbackEmitter {
    fn emit(&self, emit_at: u64, packet: TimestampedPacket) -> EmitHandle {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.emitted.lock().push(EmittedRecord {
            emit_at,
            packet,
            packet_number_hint: seq,
        });
        EmitHandle(seq)
    }

    fn emit_to(&self, receiver_id: &str, emit_at: u64, packet: TimestampedPacket) {
        self.targeted.lock().push(TargetedRecord {
            receiver_id: receiver_id.to_string(),
            emit_at,
            packet,
        });
    }

    fn discard(&self, handle: EmitHandle, playback_at: u64) {
        self.discarded.lock().push((handle, playback_at));
    }

    fn attach(&self, _receiver_id: ReceiverId, _transport: Arc<dyn Transport>) {}

    fn detach(&self, _receiver_id: &str) {}

    fn stop(&self) {}
}
