//! The packet scheduler for one playback session.
//!
//! A `Broadcaster` turns a [`SourceStream`] into a paced stream of
//! timestamped packets, keeps the sliding in-flight window of unplayed
//! packets for catch-up and recovery, and reports source transitions and
//! completion to its owning channel.
//!
//! Timestamp formula: `playback_at(n) = start_time + latency + n * interval`.
//! Start fast-fills at `interval / BUFFER_EMIT_DIVISOR` pacing to pack the
//! receiver buffer before the first playback deadline; steady state then
//! matches real time exactly.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use crate::emit::{EmitHandle, Emitter, TimestampedPacket};
use crate::protocol_constants::BUFFER_EMIT_DIVISOR;
use crate::source::{Frame, SourceId, SourceStream, StreamFrame};

/// Why a broadcaster is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Pause: unplayed packets are revoked and returned to the stream so
    /// playback resumes exactly where it left off.
    Normal,
    /// Skip: unplayed packets are revoked and dropped.
    Skip,
    /// The stream drained on its own; everything is already on the wire.
    StreamFinished,
}

/// Broadcaster lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcasterState {
    /// Constructed, not yet started.
    Created,
    /// Emitting packets from the stream.
    Running,
    /// Stream exhausted; ticking until the in-flight window drains.
    Draining,
    /// Done. No further effects.
    Terminated,
}

/// Notifications surfaced to the owning channel by a scheduling step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcasterNotice {
    /// Playback crossed into a new source (first source included).
    SourceChanged {
        /// The source now audible on receivers.
        source_id: SourceId,
    },
    /// The stream finished and the in-flight window drained.
    Finished,
}

/// A packet handed to the emitter whose playback instant is still ahead.
#[derive(Debug, Clone)]
pub struct InFlightPacket {
    /// Handle for revocation at the emitter.
    pub handle: EmitHandle,
    /// Position in this broadcaster's emission sequence.
    pub packet_number: u64,
    /// When the packet was (or will be) handed to the wire.
    pub emit_at: u64,
    /// When receivers must render it.
    pub playback_at: u64,
    /// Source the payload belongs to.
    pub source_id: SourceId,
    /// The PCM payload.
    pub bytes: Bytes,
}

/// The packet scheduler for one channel's active playback session.
pub struct Broadcaster {
    emitter: Arc<dyn Emitter>,
    stream_interval: u64,
    state: BroadcasterState,
    start_time: u64,
    latency: u64,
    emit_time: u64,
    packet_number: u64,
    in_flight: VecDeque<InFlightPacket>,
    /// Source currently audible (last played packet's source).
    playing_source: Option<SourceId>,
    /// Packets of the current source that have crossed their deadline.
    played_of_current: u64,
}

impl Broadcaster {
    /// Creates a broadcaster bound to an emitter.
    #[must_use]
    pub fn new(emitter: Arc<dyn Emitter>, stream_interval: u64) -> Self {
        Self {
            emitter,
            stream_interval,
            state: BroadcasterState::Created,
            start_time: 0,
            latency: 0,
            emit_time: 0,
            packet_number: 0,
            in_flight: VecDeque::new(),
            playing_source: None,
            played_of_current: 0,
        }
    }

    /// Fast-fills receiver buffers: pulls up to `buffer_size` frames and
    /// emits them at `BUFFER_EMIT_DIVISOR`x real-time pacing.
    ///
    /// Frame *k* gets `emit_at = now + k * (interval / 4)` and
    /// `playback_at = now + latency + k * interval`.
    pub fn start(
        &mut self,
        now: u64,
        latency: u64,
        buffer_size: usize,
        source: &mut SourceStream,
    ) {
        debug_assert_eq!(self.state, BroadcasterState::Created);
        self.start_time = now;
        self.latency = latency;
        self.emit_time = now;
        self.state = BroadcasterState::Running;

        let fill_step = self.stream_interval / BUFFER_EMIT_DIVISOR;
        let mut pulled = 0usize;
        while pulled < buffer_size {
            match source.next_frame() {
                StreamFrame::Frame(frame) => {
                    let emit_at = now + pulled as u64 * fill_step;
                    self.dispatch(emit_at, frame.source_id, frame.bytes);
                    pulled += 1;
                }
                StreamFrame::End => {
                    self.state = BroadcasterState::Draining;
                    break;
                }
            }
        }
        self.emit_time = now + pulled as u64 * fill_step;

        log::debug!(
            "[Broadcaster] Started: start_time={} latency={} buffered {} frames",
            now,
            latency,
            pulled
        );
    }

    /// One steady-state scheduling step, driven by the controller tick.
    ///
    /// Pulls and emits at most one frame when `emit_time` is due, then
    /// prunes the in-flight window against `now`. Returns notices for the
    /// owning channel.
    pub fn emit(
        &mut self,
        now: u64,
        interval: u64,
        source: &mut SourceStream,
    ) -> Vec<BroadcasterNotice> {
        let mut notices = Vec::new();
        if matches!(
            self.state,
            BroadcasterState::Created | BroadcasterState::Terminated
        ) {
            return notices;
        }

        if self.state == BroadcasterState::Running && self.emit_due(now, interval) {
            match source.next_frame() {
                StreamFrame::Frame(frame) => {
                    let emit_at = self.emit_time;
                    self.dispatch(emit_at, frame.source_id, frame.bytes);
                    self.emit_time += self.stream_interval;
                }
                StreamFrame::End => {
                    log::debug!(
                        "[Broadcaster] End of stream after {} packets, draining {}",
                        self.packet_number,
                        self.in_flight.len()
                    );
                    self.state = BroadcasterState::Draining;
                }
            }
        }

        self.prune(now, &mut notices);

        if self.state == BroadcasterState::Draining && self.in_flight.is_empty() {
            self.state = BroadcasterState::Terminated;
            notices.push(BroadcasterNotice::Finished);
        }
        notices
    }

    /// Stops the broadcaster.
    ///
    /// `Normal` revokes unplayed packets at the emitter and returns them to
    /// the stream in original order; `Skip` revokes and drops them;
    /// `StreamFinished` leaves the wire untouched.
    pub fn stop(&mut self, reason: StopReason, now: u64, source: &mut SourceStream) {
        match reason {
            StopReason::Normal => {
                let mut unplayed = Vec::with_capacity(self.in_flight.len());
                for packet in self.in_flight.drain(..) {
                    if packet.playback_at > now {
                        self.emitter.discard(packet.handle, packet.playback_at);
                        unplayed.push(Frame {
                            source_id: packet.source_id,
                            bytes: packet.bytes,
                        });
                    }
                }
                log::debug!(
                    "[Broadcaster] Stopped (normal), rebuffering {} unplayed frames",
                    unplayed.len()
                );
                source.rebuffer(unplayed);
            }
            StopReason::Skip => {
                for packet in self.in_flight.drain(..) {
                    self.emitter.discard(packet.handle, packet.playback_at);
                }
                log::debug!("[Broadcaster] Stopped (skip), in-flight discarded");
            }
            StopReason::StreamFinished => {
                self.in_flight.clear();
                log::debug!("[Broadcaster] Stopped (stream finished)");
            }
        }
        self.state = BroadcasterState::Terminated;
    }

    /// Re-sends the current in-flight window to one receiver, preserving
    /// every `playback_at`. Used when a receiver joins mid-playback.
    pub fn buffer_receiver(&self, receiver_id: &str, now: u64) {
        log::debug!(
            "[Broadcaster] Catching up {} with {} in-flight packets",
            receiver_id,
            self.in_flight.len()
        );
        for packet in &self.in_flight {
            self.emitter.emit_to(
                receiver_id,
                now,
                TimestampedPacket {
                    playback_at: packet.playback_at,
                    source_id: packet.source_id.clone(),
                    bytes: packet.bytes.clone(),
                },
            );
        }
    }

    /// Progress through the currently audible source: `(source_id, ms)`.
    #[must_use]
    pub fn progress(&self) -> Option<(SourceId, u64)> {
        self.playing_source.as_ref().map(|id| {
            (
                id.clone(),
                self.played_of_current * self.stream_interval / 1_000,
            )
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> BroadcasterState {
        self.state
    }

    /// Packets dispatched since `start`.
    #[must_use]
    pub fn packet_number(&self) -> u64 {
        self.packet_number
    }

    /// Number of packets whose playback instant is still ahead.
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// The in-flight window, oldest first.
    #[must_use]
    pub fn in_flight(&self) -> &VecDeque<InFlightPacket> {
        &self.in_flight
    }

    /// The normative playback instant for packet `n`.
    #[must_use]
    pub fn timestamp_for_packet(&self, n: u64) -> u64 {
        self.start_time + self.latency + n * self.stream_interval
    }

    /// Whether the scheduler owes the wire a packet at this tick.
    fn emit_due(&self, now: u64, interval: u64) -> bool {
        let target = now + interval;
        target.abs_diff(self.emit_time) < interval || target > self.emit_time
    }

    fn dispatch(&mut self, emit_at: u64, source_id: SourceId, bytes: Bytes) {
        let playback_at = self.timestamp_for_packet(self.packet_number);
        let handle = self.emitter.emit(
            emit_at,
            TimestampedPacket {
                playback_at,
                source_id: source_id.clone(),
                bytes: bytes.clone(),
            },
        );
        self.in_flight.push_back(InFlightPacket {
            handle,
            packet_number: self.packet_number,
            emit_at,
            playback_at,
            source_id,
            bytes,
        });
        self.packet_number += 1;
    }

    /// Drops packets whose playback instant has passed, scanning them for
    /// source transitions (the "track changed" signal).
    fn prune(&mut self, now: u64, notices: &mut Vec<BroadcasterNotice>) {
        while self
            .in_flight
            .front()
            .is_some_and(|p| p.playback_at <= now)
        {
            let Some(played) = self.in_flight.pop_front() else {
                break;
            };
            if self.playing_source.as_deref() != Some(played.source_id.as_str()) {
                self.playing_source = Some(played.source_id.clone());
                self.played_of_current = 0;
                notices.push(BroadcasterNotice::SourceChanged {
                    source_id: played.source_id,
                });
            }
            self.played_of_current += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopbackEmitter;

    const INTERVAL: u64 = 20_000;
    const STEP: usize = 8;
    const LATENCY: u64 = 50_000;

    fn stream_of(sources: Vec<(&str, usize)>) -> SourceStream {
        let playlist: Vec<Box<dyn crate::source::Source>> = sources
            .into_iter()
            .map(|(id, frames)| {
                Box::new(crate::source::MemorySource::new(id, vec![1u8; frames * STEP]))
                    as Box<dyn crate::source::Source>
            })
            .collect();
        SourceStream::new(playlist, STEP, 1_000, 4)
    }

    fn broadcaster(emitter: &Arc<LoopbackEmitter>) -> Broadcaster {
        Broadcaster::new(emitter.clone() as Arc<dyn Emitter>, INTERVAL)
    }

    #[test]
    fn start_fast_fills_with_quarter_interval_pacing() {
        let emitter = LoopbackEmitter::new();
        let mut source = stream_of(vec![("a", 50)]);
        let mut b = broadcaster(&emitter);

        b.start(1_000, LATENCY, 25, &mut source);

        let emitted = emitter.emitted();
        assert_eq!(emitted.len(), 25);
        for (k, record) in emitted.iter().enumerate() {
            let k = k as u64;
            assert_eq!(record.emit_at, 1_000 + k * (INTERVAL / 4));
            assert_eq!(record.packet.playback_at, 1_000 + LATENCY + k * INTERVAL);
        }
        assert_eq!(b.state(), BroadcasterState::Running);
        assert_eq!(b.packet_number(), 25);
        assert_eq!(b.in_flight_len(), 25);
    }

    #[test]
    fn playback_timestamps_follow_the_formula() {
        let emitter = LoopbackEmitter::new();
        let mut source = stream_of(vec![("a", 40)]);
        let mut b = broadcaster(&emitter);

        b.start(0, LATENCY, 10, &mut source);

        // Walk steady state for a while
        let mut now = 0;
        for _ in 0..80 {
            now += INTERVAL / 4;
            b.emit(now, INTERVAL / 4, &mut source);
        }

        for record in emitter.emitted().iter() {
            let n = record.packet_number_hint;
            assert_eq!(record.packet.playback_at, LATENCY + n * INTERVAL);
        }
    }

    #[test]
    fn packet_numbers_are_contiguous() {
        let emitter = LoopbackEmitter::new();
        let mut source = stream_of(vec![("a", 30)]);
        let mut b = broadcaster(&emitter);

        b.start(0, LATENCY, 10, &mut source);
        let mut now = 0;
        for _ in 0..200 {
            now += INTERVAL / 4;
            b.emit(now, INTERVAL / 4, &mut source);
        }

        let emitted = emitter.emitted();
        assert_eq!(emitted.len(), 30);
        for (i, record) in emitted.iter().enumerate() {
            assert_eq!(
                record.packet.playback_at,
                LATENCY + i as u64 * INTERVAL,
                "gap or duplicate at packet {}",
                i
            );
        }
    }

    #[test]
    fn steady_state_advances_one_interval_per_due_tick() {
        let emitter = LoopbackEmitter::new();
        let mut source = stream_of(vec![("a", 100)]);
        let mut b = broadcaster(&emitter);

        b.start(0, LATENCY, 25, &mut source);
        let after_fill = emitter.emitted().len();
        assert_eq!(after_fill, 25);

        // One tick interval later: exactly one more frame is due
        let tick = INTERVAL / 4;
        let mut now = 25 * tick;
        b.emit(now, tick, &mut source);
        assert_eq!(emitter.emitted().len(), 26);

        // Three more quarter ticks are ahead of schedule: no emission until
        // the next full interval boundary
        for _ in 0..3 {
            now += tick;
            b.emit(now, tick, &mut source);
        }
        assert_eq!(emitter.emitted().len(), 27);
    }

    #[test]
    fn prune_keeps_only_future_playback() {
        let emitter = LoopbackEmitter::new();
        let mut source = stream_of(vec![("a", 30)]);
        let mut b = broadcaster(&emitter);

        b.start(0, LATENCY, 10, &mut source);
        assert_eq!(b.in_flight_len(), 10);

        // Jump past the first three playback deadlines
        let now = LATENCY + 2 * INTERVAL + 1;
        let notices = b.emit(now, INTERVAL / 4, &mut source);

        // First non-nil source observation announces the source
        assert!(notices
            .iter()
            .any(|n| matches!(n, BroadcasterNotice::SourceChanged { source_id } if source_id == "a")));
        assert!(b.in_flight().iter().all(|p| p.playback_at > now));
    }

    #[test]
    fn source_transition_is_announced_when_played() {
        let emitter = LoopbackEmitter::new();
        let mut source = stream_of(vec![("a", 2), ("b", 2)]);
        let mut b = broadcaster(&emitter);

        b.start(0, LATENCY, 4, &mut source);

        // Play out everything
        let now = LATENCY + 4 * INTERVAL + 1;
        let notices = b.emit(now, INTERVAL / 4, &mut source);

        let changes: Vec<_> = notices
            .iter()
            .filter_map(|n| match n {
                BroadcasterNotice::SourceChanged { source_id } => Some(source_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(changes, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn stop_normal_rebuffers_unplayed_in_order() {
        let emitter = LoopbackEmitter::new();
        let mut source = stream_of(vec![("a", 20)]);
        let mut b = broadcaster(&emitter);

        b.start(0, LATENCY, 10, &mut source);

        // Two packets played, eight still in flight
        let now = LATENCY + INTERVAL + 1;
        b.emit(now, INTERVAL / 4, &mut source);
        let in_flight: Vec<_> = b.in_flight().iter().map(|p| p.packet_number).collect();

        b.stop(StopReason::Normal, now, &mut source);
        assert_eq!(b.state(), BroadcasterState::Terminated);
        assert_eq!(emitter.discarded().len(), in_flight.len());

        // The next pull resumes at the first unplayed frame
        let mut resumed = broadcaster(&emitter);
        emitter.clear();
        resumed.start(now, LATENCY, 4, &mut source);
        let first = &emitter.emitted()[0];
        assert_eq!(first.packet.source_id, "a");
        // Rebuffered frames come back before any fresh stream read
        assert_eq!(resumed.packet_number(), 4);
    }

    #[test]
    fn stop_skip_discards_without_rebuffer() {
        let emitter = LoopbackEmitter::new();
        let mut source = stream_of(vec![("a", 10), ("b", 10)]);
        let mut b = broadcaster(&emitter);

        b.start(0, LATENCY, 5, &mut source);
        let now = 2 * INTERVAL;
        b.stop(StopReason::Skip, now, &mut source);

        assert_eq!(emitter.discarded().len(), 5);
        source.flush();
        source.skip_to("b").unwrap();

        emitter.clear();
        let mut next = broadcaster(&emitter);
        next.start(now, LATENCY, 5, &mut source);
        let first = &emitter.emitted()[0];
        assert_eq!(first.packet.source_id, "b");
        assert_eq!(first.packet.playback_at, now + LATENCY);
    }

    #[test]
    fn stop_for_stream_finished_leaves_the_wire_alone() {
        let emitter = LoopbackEmitter::new();
        let mut source = stream_of(vec![("a", 5)]);
        let mut b = broadcaster(&emitter);

        b.start(0, LATENCY, 5, &mut source);
        b.stop(StopReason::StreamFinished, 10_000, &mut source);

        assert_eq!(b.state(), BroadcasterState::Terminated);
        assert!(emitter.discarded().is_empty());
        assert_eq!(source.next_frame(), StreamFrame::End);
    }

    #[test]
    fn drains_then_finishes_after_end_of_stream() {
        let emitter = LoopbackEmitter::new();
        let mut source = stream_of(vec![("a", 3)]);
        let mut b = broadcaster(&emitter);

        b.start(0, LATENCY, 10, &mut source);
        assert_eq!(b.state(), BroadcasterState::Draining);
        assert_eq!(b.in_flight_len(), 3);

        // Before playback finishes: still draining
        let notices = b.emit(INTERVAL, INTERVAL / 4, &mut source);
        assert!(notices.is_empty() || !notices.contains(&BroadcasterNotice::Finished));

        // After the last playback deadline the window empties
        let now = LATENCY + 3 * INTERVAL + 1;
        let notices = b.emit(now, INTERVAL / 4, &mut source);
        assert!(notices.contains(&BroadcasterNotice::Finished));
        assert_eq!(b.state(), BroadcasterState::Terminated);
    }

    #[test]
    fn in_flight_window_covers_the_latency_budget() {
        let emitter = LoopbackEmitter::new();
        let mut source = stream_of(vec![("a", 500)]);
        let mut b = broadcaster(&emitter);

        b.start(0, LATENCY, 25, &mut source);

        let tick = INTERVAL / 4;
        let mut now = 0;
        for _ in 0..400 {
            now += tick;
            b.emit(now, tick, &mut source);
            if b.state() == BroadcasterState::Running && now > LATENCY {
                assert!(
                    b.in_flight_len() as u64 * INTERVAL >= LATENCY,
                    "window {} frames too small at t={}",
                    b.in_flight_len(),
                    now
                );
            }
        }
    }

    #[test]
    fn buffer_receiver_replays_the_window_untouched() {
        let emitter = LoopbackEmitter::new();
        let mut source = stream_of(vec![("a", 40)]);
        let mut b = broadcaster(&emitter);

        b.start(0, LATENCY, 25, &mut source);
        let expected: Vec<u64> = b.in_flight().iter().map(|p| p.playback_at).collect();

        emitter.clear();
        b.buffer_receiver("late-joiner", 123_456);

        let targeted = emitter.targeted();
        assert_eq!(targeted.len(), expected.len());
        for (record, playback_at) in targeted.iter().zip(expected) {
            assert_eq!(record.receiver_id, "late-joiner");
            assert_eq!(record.packet.playback_at, playback_at);
        }
    }
}
