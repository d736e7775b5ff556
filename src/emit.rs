//! Packet emission: scheduled wire delivery to receiver transports.
//!
//! The broadcaster hands the emitter `(emit_at, packet)` pairs; the
//! emitter holds them until `emit_at` and then fans the encoded frame out
//! to every attached transport (or one target, for late-join catch-up).
//! Packets not yet on the wire can be revoked with `discard`.
//!
//! Failure semantics: a failed send is logged and reported so the owning
//! channel can mark the receiver offline. There are no retries; audio
//! frames go stale faster than a retry would help.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::MonotonicClock;
use crate::protocol::encode_audio_packet;
use crate::receiver::ReceiverId;
use crate::source::SourceId;
use crate::transport::Transport;

/// A frame stamped with its playback deadline, ready for the wire.
#[derive(Debug, Clone)]
pub struct TimestampedPacket {
    /// Monotonic-clock instant the receiver must render the frame.
    pub playback_at: u64,
    /// Source the frame belongs to.
    pub source_id: SourceId,
    /// One step of PCM.
    pub bytes: Bytes,
}

/// Opaque handle to a scheduled emission, usable for [`Emitter::discard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmitHandle(pub(crate) u64);

/// Out-of-band notices from the emitter to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportNotice {
    /// A send to this receiver failed; it should be considered offline.
    SendFailed {
        /// The receiver whose transport failed.
        receiver_id: ReceiverId,
    },
}

/// Schedules timed delivery of packets to receiver transports.
pub trait Emitter: Send + Sync {
    /// Schedules delivery of `packet` to every attached receiver at local
    /// time `emit_at` (past values deliver immediately). Returns a handle
    /// usable for [`Emitter::discard`].
    fn emit(&self, emit_at: u64, packet: TimestampedPacket) -> EmitHandle;

    /// Schedules delivery to a single receiver, preserving the packet's
    /// `playback_at`. Used for late-join catch-up.
    fn emit_to(&self, receiver_id: &str, emit_at: u64, packet: TimestampedPacket);

    /// Revokes a packet not yet on the wire. No-op when already sent.
    /// Idempotent.
    fn discard(&self, handle: EmitHandle, playback_at: u64);

    /// Adds a receiver transport to the delivery set.
    fn attach(&self, receiver_id: ReceiverId, transport: Arc<dyn Transport>);

    /// Removes a receiver from the delivery set. Packets already on the
    /// wire are not revoked.
    fn detach(&self, receiver_id: &str);

    /// Terminates the emitter, discarding all pending sends.
    fn stop(&self);
}

enum EmitCmd {
    Send {
        seq: u64,
        target: Option<ReceiverId>,
        emit_at: u64,
        packet: TimestampedPacket,
    },
    Discard {
        seq: u64,
        playback_at: u64,
    },
    Attach {
        receiver_id: ReceiverId,
        transport: Arc<dyn Transport>,
    },
    Detach {
        receiver_id: ReceiverId,
    },
}

/// [`Emitter`] implementation over per-receiver [`Transport`]s.
///
/// One task owns the schedule; the trait methods only enqueue commands, so
/// they are cheap and safe to call from the scheduler's hot path.
pub struct TransportEmitter {
    tx: mpsc::UnboundedSender<EmitCmd>,
    next_seq: AtomicU64,
    cancel: CancellationToken,
}

impl TransportEmitter {
    /// Spawns the emitter task. Send failures are reported on `notices`.
    #[must_use]
    pub fn spawn(
        clock: MonotonicClock,
        notices: mpsc::UnboundedSender<TransportNotice>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = EmitterTask {
            clock,
            transports: HashMap::new(),
            due: BTreeMap::new(),
            by_seq: HashMap::new(),
            notices,
        };
        tokio::spawn(task.run(rx, cancel.clone()));
        Arc::new(Self {
            tx,
            next_seq: AtomicU64::new(0),
            cancel,
        })
    }

    fn send_cmd(&self, cmd: EmitCmd) {
        if self.tx.send(cmd).is_err() {
            log::debug!("[Emitter] Command after shutdown dropped");
        }
    }
}

impl Emitter for TransportEmitter {
    fn emit(&self, emit_at: u64, packet: TimestampedPacket) -> EmitHandle {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.send_cmd(EmitCmd::Send {
            seq,
            target: None,
            emit_at,
            packet,
        });
        EmitHandle(seq)
    }

    fn emit_to(&self, receiver_id: &str, emit_at: u64, packet: TimestampedPacket) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.send_cmd(EmitCmd::Send {
            seq,
            target: Some(receiver_id.to_string()),
            emit_at,
            packet,
        });
    }

    fn discard(&self, handle: EmitHandle, playback_at: u64) {
        self.send_cmd(EmitCmd::Discard {
            seq: handle.0,
            playback_at,
        });
    }

    fn attach(&self, receiver_id: ReceiverId, transport: Arc<dyn Transport>) {
        self.send_cmd(EmitCmd::Attach {
            receiver_id,
            transport,
        });
    }

    fn detach(&self, receiver_id: &str) {
        self.send_cmd(EmitCmd::Detach {
            receiver_id: receiver_id.to_string(),
        });
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

struct ScheduledSend {
    target: Option<ReceiverId>,
    packet: TimestampedPacket,
}

struct EmitterTask {
    clock: MonotonicClock,
    transports: HashMap<ReceiverId, Arc<dyn Transport>>,
    /// Pending sends ordered by `(emit_at, seq)`.
    due: BTreeMap<(u64, u64), ScheduledSend>,
    /// Reverse index for discard by handle.
    by_seq: HashMap<u64, u64>,
    notices: mpsc::UnboundedSender<TransportNotice>,
}

impl EmitterTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EmitCmd>, cancel: CancellationToken) {
        loop {
            // Deadline of the earliest pending send; computed outside the
            // select so the arm holds no borrow of the schedule.
            let deadline = self
                .due
                .keys()
                .next()
                .map(|&(emit_at, _)| self.clock.instant_at(emit_at));
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    log::debug!("[Emitter] Stopping with {} pending sends", self.due.len());
                    break;
                }

                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },

                _ = until(deadline) => {
                    self.deliver_due().await;
                }
            }
        }
    }

    fn handle(&mut self, cmd: EmitCmd) {
        match cmd {
            EmitCmd::Send {
                seq,
                target,
                emit_at,
                packet,
            } => {
                self.by_seq.insert(seq, emit_at);
                self.due.insert((emit_at, seq), ScheduledSend { target, packet });
            }
            EmitCmd::Discard { seq, playback_at } => {
                match self.by_seq.remove(&seq) {
                    Some(emit_at) => {
                        self.due.remove(&(emit_at, seq));
                        log::trace!(
                            "[Emitter] Discarded pending packet playback_at={}",
                            playback_at
                        );
                    }
                    // Already sent (or double discard): no-op
                    None => log::trace!(
                        "[Emitter] Discard for sent packet playback_at={} ignored",
                        playback_at
                    ),
                }
            }
            EmitCmd::Attach {
                receiver_id,
                transport,
            } => {
                log::debug!(
                    "[Emitter] Attached receiver {} ({})",
                    receiver_id,
                    transport.peer()
                );
                self.transports.insert(receiver_id, transport);
            }
            EmitCmd::Detach { receiver_id } => {
                self.transports.remove(&receiver_id);
                log::debug!("[Emitter] Detached receiver {}", receiver_id);
            }
        }
    }

    async fn deliver_due(&mut self) {
        let now = self.clock.now();
        // Everything with emit_at <= now is due; split the rest back in
        let pending = self.due.split_off(&(now + 1, 0));
        let due_now = std::mem::replace(&mut self.due, pending);
        let mut ready = Vec::with_capacity(due_now.len());
        for ((_, seq), send) in due_now {
            self.by_seq.remove(&seq);
            ready.push(send);
        }

        for send in ready {
            let wire = encode_audio_packet(send.packet.playback_at, &send.packet.bytes);
            match send.target {
                Some(ref receiver_id) => {
                    if let Some(transport) = self.transports.get(receiver_id) {
                        self.send_one(receiver_id, transport, wire).await;
                    }
                }
                None => {
                    let sends = self
                        .transports
                        .iter()
                        .map(|(id, transport)| {
                            let wire = wire.clone();
                            async move {
                                (id.clone(), transport.send(wire).await)
                            }
                        })
                        .collect::<Vec<_>>();
                    for (receiver_id, result) in futures::future::join_all(sends).await {
                        if let Err(e) = result {
                            self.report_failure(&receiver_id, &e);
                        }
                    }
                }
            }
        }
    }

    async fn send_one(&self, receiver_id: &str, transport: &Arc<dyn Transport>, wire: Bytes) {
        if let Err(e) = transport.send(wire).await {
            self.report_failure(receiver_id, &e);
        }
    }

    fn report_failure(&self, receiver_id: &str, error: &std::io::Error) {
        log::warn!("[Emitter] Send to {} failed: {}", receiver_id, error);
        let _ = self.notices.send(TransportNotice::SendFailed {
            receiver_id: receiver_id.to_string(),
        });
    }
}

async fn until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
