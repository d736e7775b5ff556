//! Channel: the playback group state machine.
//!
//! A channel owns one source stream for its lifetime, a set of receivers,
//! and at most one broadcaster at a time. It is an actor: one task drains
//! a single command queue, so broadcaster commands are observed exactly in
//! the order the channel issued them and ticks interleave with control
//! commands FIFO.
//!
//! Responsibilities:
//! - play/pause/skip transitions and coordinated shutdown
//! - receiver attach/detach with exclusive ownership (via the registry)
//! - latency budget: `max(receiver latency) + buffer headroom`
//! - late-join catch-up (`buffer_receiver`) and offline sweeps
//! - event emission for external UIs

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::broadcaster::{Broadcaster, BroadcasterNotice, StopReason};
use crate::clock::MonotonicClock;
use crate::config::{StreamConfig, SyncConfig};
use crate::emit::{Emitter, TransportEmitter, TransportNotice};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventEmitter, PlaybackEvent, PlaybackStatus, ReceiverEvent, VolumeTarget};
use crate::protocol::ControlMessage;
use crate::protocol_constants::PROGRESS_TICK_MULTIPLE;
use crate::receiver::{Receiver, ReceiverId, ReceiverStatus};
use crate::registry::{ChannelId, Registry};
use crate::source::{Source, SourceId, SourceStream};
use crate::store::StateStore;
use crate::transport::Transport;

/// Channel playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelState {
    /// No broadcaster; position preserved.
    Stop,
    /// A broadcaster is emitting.
    Play,
    /// Transitioning between broadcasters during a skip.
    Skip,
}

/// Point-in-time view of a channel for reporting and tests.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnapshot {
    /// Playback state.
    pub state: ChannelState,
    /// Receiver membership.
    pub receivers: Vec<ReceiverStatus>,
    /// Whether a broadcaster is live.
    pub broadcasting: bool,
    /// Packets dispatched by the current broadcaster, if any.
    pub packets_dispatched: Option<u64>,
}

enum ChannelCommand {
    PlayPause {
        reply: oneshot::Sender<PlaybackStatus>,
    },
    Skip {
        source_id: SourceId,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    Attach {
        receiver_id: ReceiverId,
        transport: Arc<dyn Transport>,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    Detach {
        receiver_id: ReceiverId,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    SetReceiverVolume {
        receiver_id: ReceiverId,
        volume: f32,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    SetChannelVolume {
        volume: f32,
    },
    ReceiverSync {
        receiver_id: ReceiverId,
        latency_us: u64,
    },
    TransportFailed {
        receiver_id: ReceiverId,
    },
    Tick {
        now: u64,
        interval: u64,
    },
    Snapshot {
        reply: oneshot::Sender<ChannelSnapshot>,
    },
    Shutdown,
}

/// Clone-able address of a channel actor.
///
/// Request/response methods (`call`) resolve once the actor has processed
/// the command; fire-and-forget methods (`cast`) return immediately.
#[derive(Clone, Debug)]
pub struct ChannelHandle {
    id: ChannelId,
    tx: mpsc::UnboundedSender<ChannelCommand>,
}

impl ChannelHandle {
    /// The channel's id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ChannelCommand,
    ) -> CoreResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| CoreError::ChannelClosed)?;
        rx.await.map_err(|_| CoreError::ChannelClosed)
    }

    fn cast(&self, cmd: ChannelCommand) {
        if self.tx.send(cmd).is_err() {
            log::debug!("[Channel] Command to closed channel {} dropped", self.id);
        }
    }

    /// Toggles playback. Returns the status entered.
    pub async fn play_pause(&self) -> CoreResult<PlaybackStatus> {
        self.call(|reply| ChannelCommand::PlayPause { reply }).await
    }

    /// Skips to the named source. While playing, playback restarts there
    /// immediately; while stopped, only the cursor moves.
    pub async fn skip(&self, source_id: impl Into<SourceId>) -> CoreResult<()> {
        let source_id = source_id.into();
        self.call(|reply| ChannelCommand::Skip { source_id, reply })
            .await?
    }

    /// Attaches a receiver. Rejected when another channel owns it.
    pub async fn attach_receiver(
        &self,
        receiver_id: impl Into<ReceiverId>,
        transport: Arc<dyn Transport>,
    ) -> CoreResult<()> {
        let receiver_id = receiver_id.into();
        self.call(|reply| ChannelCommand::Attach {
            receiver_id,
            transport,
            reply,
        })
        .await?
    }

    /// Detaches a receiver. Packets already dispatched are not revoked.
    pub async fn detach_receiver(&self, receiver_id: &str) -> CoreResult<()> {
        let receiver_id = receiver_id.to_string();
        self.call(|reply| ChannelCommand::Detach { receiver_id, reply })
            .await?
    }

    /// Sets (and persists) a receiver volume, clamped to [0.0, 1.0].
    pub async fn set_receiver_volume(&self, receiver_id: &str, volume: f32) -> CoreResult<()> {
        let receiver_id = receiver_id.to_string();
        self.call(|reply| ChannelCommand::SetReceiverVolume {
            receiver_id,
            volume,
            reply,
        })
        .await?
    }

    /// Sets the channel master volume, clamped to [0.0, 1.0].
    pub fn set_channel_volume(&self, volume: f32) {
        self.cast(ChannelCommand::SetChannelVolume { volume });
    }

    /// Reports a completed sync round for a receiver.
    pub fn report_sync(&self, receiver_id: &str, latency_us: u64) {
        self.cast(ChannelCommand::ReceiverSync {
            receiver_id: receiver_id.to_string(),
            latency_us,
        });
    }

    /// Drives one scheduling step. Called by the controller.
    pub(crate) fn tick(&self, now: u64, interval: u64) {
        self.cast(ChannelCommand::Tick { now, interval });
    }

    /// Current state for reporting and tests.
    pub async fn snapshot(&self) -> CoreResult<ChannelSnapshot> {
        self.call(|reply| ChannelCommand::Snapshot { reply }).await
    }

    /// Stops playback, notifies receivers, and terminates the actor.
    pub fn shutdown(&self) {
        self.cast(ChannelCommand::Shutdown);
    }
}

/// The channel actor.
pub struct Channel {
    id: ChannelId,
    state: ChannelState,
    source: SourceStream,
    receivers: HashMap<ReceiverId, Receiver>,
    broadcaster: Option<Broadcaster>,
    emitter: Arc<dyn Emitter>,
    clock: MonotonicClock,
    events: Arc<dyn EventEmitter>,
    store: Arc<dyn StateStore>,
    registry: Arc<Registry>,
    config: StreamConfig,
    sync: SyncConfig,
    volume: f32,
    tick_count: u64,
}

impl Channel {
    /// Generates a fresh channel id.
    #[must_use]
    pub fn generate_id() -> ChannelId {
        Uuid::new_v4().to_string()
    }

    /// Spawns a channel whose playlist is read from the persisted state.
    ///
    /// The store yields the channel's ordered source ids at construction;
    /// `resolve` maps each id to its decoded PCM source (the decode
    /// boundary lives with the caller). Ids that no longer resolve are
    /// logged and dropped from the playlist.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_from_store(
        id: ChannelId,
        mut resolve: impl FnMut(&SourceId) -> Option<Box<dyn Source>>,
        clock: MonotonicClock,
        events: Arc<dyn EventEmitter>,
        store: Arc<dyn StateStore>,
        registry: Arc<Registry>,
        config: StreamConfig,
        sync: SyncConfig,
    ) -> ChannelHandle {
        let playlist: Vec<Box<dyn Source>> = store
            .load_playlist(&id)
            .iter()
            .filter_map(|source_id| {
                let source = resolve(source_id);
                if source.is_none() {
                    log::warn!(
                        "[Channel] {} dropping unresolvable source {}",
                        id,
                        source_id
                    );
                }
                source
            })
            .collect();
        let source = SourceStream::new(
            playlist,
            config.bytes_per_step(),
            config.byte_rate(),
            config.source_error_limit,
        );
        Self::spawn(id, source, clock, events, store, registry, config, sync)
    }

    /// Spawns a channel with its own [`TransportEmitter`].
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: ChannelId,
        source: SourceStream,
        clock: MonotonicClock,
        events: Arc<dyn EventEmitter>,
        store: Arc<dyn StateStore>,
        registry: Arc<Registry>,
        config: StreamConfig,
        sync: SyncConfig,
    ) -> ChannelHandle {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let emitter = TransportEmitter::spawn(clock, notice_tx);
        Self::spawn_with_emitter(
            id,
            source,
            emitter,
            Some(notice_rx),
            clock,
            events,
            store,
            registry,
            config,
            sync,
        )
    }

    /// Spawns a channel on a caller-provided emitter (tests, embedding).
    #[allow(clippy::too_many_arguments)]
    pub fn spawn_with_emitter(
        id: ChannelId,
        source: SourceStream,
        emitter: Arc<dyn Emitter>,
        notices: Option<mpsc::UnboundedReceiver<TransportNotice>>,
        clock: MonotonicClock,
        events: Arc<dyn EventEmitter>,
        store: Arc<dyn StateStore>,
        registry: Arc<Registry>,
        config: StreamConfig,
        sync: SyncConfig,
    ) -> ChannelHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ChannelHandle { id: id.clone(), tx };

        if let Some(mut notices) = notices {
            let forward = handle.clone();
            tokio::spawn(async move {
                while let Some(notice) = notices.recv().await {
                    match notice {
                        TransportNotice::SendFailed { receiver_id } => {
                            forward.cast(ChannelCommand::TransportFailed { receiver_id });
                        }
                    }
                }
            });
        }

        let channel = Self {
            id,
            state: ChannelState::Stop,
            source,
            receivers: HashMap::new(),
            broadcaster: None,
            emitter,
            clock,
            events,
            store,
            registry,
            config,
            sync,
            volume: 1.0,
            tick_count: 0,
        };
        channel.registry.register_channel(handle.clone());
        tokio::spawn(channel.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ChannelCommand>) {
        log::info!("[Channel] {} started", self.id);
        while let Some(cmd) = rx.recv().await {
            match cmd {
                ChannelCommand::PlayPause { reply } => {
                    let _ = reply.send(self.handle_play_pause());
                }
                ChannelCommand::Skip { source_id, reply } => {
                    let _ = reply.send(self.handle_skip(source_id));
                }
                ChannelCommand::Attach {
                    receiver_id,
                    transport,
                    reply,
                } => {
                    let _ = reply.send(self.handle_attach(receiver_id, transport));
                }
                ChannelCommand::Detach { receiver_id, reply } => {
                    let _ = reply.send(self.handle_detach(&receiver_id));
                }
                ChannelCommand::SetReceiverVolume {
                    receiver_id,
                    volume,
                    reply,
                } => {
                    let _ = reply.send(self.handle_set_receiver_volume(&receiver_id, volume));
                }
                ChannelCommand::SetChannelVolume { volume } => {
                    self.volume = volume.clamp(0.0, 1.0);
                    self.events.emit_receiver(ReceiverEvent::VolumeChanged {
                        id: self.id.clone(),
                        target: VolumeTarget::Channel,
                        volume: self.volume,
                    });
                }
                ChannelCommand::ReceiverSync {
                    receiver_id,
                    latency_us,
                } => self.handle_sync_report(&receiver_id, latency_us),
                ChannelCommand::TransportFailed { receiver_id } => {
                    self.handle_transport_failed(&receiver_id);
                }
                ChannelCommand::Tick { now, interval } => self.handle_tick(now, interval),
                ChannelCommand::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                ChannelCommand::Shutdown => break,
            }
        }
        self.cleanup();
    }

    fn handle_play_pause(&mut self) -> PlaybackStatus {
        match self.state {
            ChannelState::Stop => {
                let now = self.clock.now();
                let latency = self.broadcast_latency();
                let mut broadcaster =
                    Broadcaster::new(Arc::clone(&self.emitter), self.config.stream_interval_us());
                broadcaster.start(now, latency, self.config.buffer_size, &mut self.source);
                self.broadcaster = Some(broadcaster);
                self.state = ChannelState::Play;
                log::info!(
                    "[Channel] {} playing (latency budget {}µs, {} receivers)",
                    self.id,
                    latency,
                    self.receivers.len()
                );
                self.events.emit_playback(PlaybackEvent::PlayPause {
                    channel_id: self.id.clone(),
                    status: PlaybackStatus::Playing,
                });
                PlaybackStatus::Playing
            }
            ChannelState::Play | ChannelState::Skip => {
                let now = self.clock.now();
                if let Some(mut broadcaster) = self.broadcaster.take() {
                    // Rebuffer preserves position; the stream is NOT reset
                    broadcaster.stop(StopReason::Normal, now, &mut self.source);
                }
                self.state = ChannelState::Stop;
                log::info!("[Channel] {} paused", self.id);
                self.events.emit_playback(PlaybackEvent::PlayPause {
                    channel_id: self.id.clone(),
                    status: PlaybackStatus::Paused,
                });
                PlaybackStatus::Paused
            }
        }
    }

    fn handle_skip(&mut self, source_id: SourceId) -> CoreResult<()> {
        if !self.source.contains(&source_id) {
            return Err(CoreError::UnknownSource(source_id));
        }
        let now = self.clock.now();
        match self.state {
            ChannelState::Play | ChannelState::Skip => {
                self.state = ChannelState::Skip;
                if let Some(mut broadcaster) = self.broadcaster.take() {
                    broadcaster.stop(StopReason::Skip, now, &mut self.source);
                }
                self.source.flush();
                self.source.skip_to(&source_id)?;

                // Receivers drop their buffered unplayed audio
                for receiver in self.receivers.values() {
                    self.send_control(receiver, ControlMessage::Flush);
                }

                let latency = self.broadcast_latency();
                let mut broadcaster =
                    Broadcaster::new(Arc::clone(&self.emitter), self.config.stream_interval_us());
                broadcaster.start(now, latency, self.config.buffer_size, &mut self.source);
                self.broadcaster = Some(broadcaster);
                self.state = ChannelState::Play;
                log::info!("[Channel] {} skipped to {}", self.id, source_id);
                Ok(())
            }
            ChannelState::Stop => {
                // Seek while stopped: the cursor moves, playback stays off
                self.source.flush();
                self.source.skip_to(&source_id)?;
                log::info!("[Channel] {} seeked to {} while stopped", self.id, source_id);
                Ok(())
            }
        }
    }

    fn handle_attach(
        &mut self,
        receiver_id: ReceiverId,
        transport: Arc<dyn Transport>,
    ) -> CoreResult<()> {
        self.registry.claim_receiver(&receiver_id, &self.id)?;
        let now = self.clock.now();

        let mut receiver = Receiver::new(receiver_id.clone(), Arc::clone(&transport), now);
        if let Some(volume) = self.store.load_volume(&receiver_id) {
            receiver.set_volume(volume);
        }
        self.emitter.attach(receiver_id.clone(), transport);

        // A late joiner catches up on the current in-flight window
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.buffer_receiver(&receiver_id, now);
        }

        self.receivers.insert(receiver_id.clone(), receiver);
        log::info!("[Channel] {} attached receiver {}", self.id, receiver_id);
        self.events.emit_receiver(ReceiverEvent::Added {
            channel_id: self.id.clone(),
            receiver_id,
        });
        Ok(())
    }

    fn handle_detach(&mut self, receiver_id: &str) -> CoreResult<()> {
        if self.receivers.remove(receiver_id).is_none() {
            return Err(CoreError::ReceiverNotFound(receiver_id.to_string()));
        }
        // Logical removal only: packets already dispatched are not revoked
        self.emitter.detach(receiver_id);
        self.registry.release_receiver(receiver_id, &self.id);
        log::info!("[Channel] {} detached receiver {}", self.id, receiver_id);
        self.events.emit_receiver(ReceiverEvent::Removed {
            channel_id: self.id.clone(),
            receiver_id: receiver_id.to_string(),
        });
        Ok(())
    }

    fn handle_set_receiver_volume(&mut self, receiver_id: &str, volume: f32) -> CoreResult<()> {
        let receiver = self
            .receivers
            .get_mut(receiver_id)
            .ok_or_else(|| CoreError::ReceiverNotFound(receiver_id.to_string()))?;
        receiver.set_volume(volume);
        let volume = receiver.volume();
        self.store.save_volume(receiver_id, volume);
        self.events.emit_receiver(ReceiverEvent::VolumeChanged {
            id: receiver_id.to_string(),
            target: VolumeTarget::Receiver,
            volume,
        });
        Ok(())
    }

    fn handle_sync_report(&mut self, receiver_id: &str, latency_us: u64) {
        let now = self.clock.now();
        match self.receivers.get_mut(receiver_id) {
            Some(receiver) => {
                if receiver.record_sync(latency_us, now) {
                    log::info!("[Channel] {} receiver {} back online", self.id, receiver_id);
                    self.events.emit_receiver(ReceiverEvent::Online {
                        receiver_id: receiver_id.to_string(),
                    });
                }
            }
            None => log::debug!(
                "[Channel] {} sync report for unknown receiver {}",
                self.id,
                receiver_id
            ),
        }
    }

    fn handle_transport_failed(&mut self, receiver_id: &str) {
        if let Some(receiver) = self.receivers.get_mut(receiver_id) {
            if receiver.mark_offline() {
                log::warn!("[Channel] {} receiver {} offline", self.id, receiver_id);
                self.events.emit_receiver(ReceiverEvent::Offline {
                    receiver_id: receiver_id.to_string(),
                });
            }
        }
    }

    fn handle_tick(&mut self, now: u64, interval: u64) {
        self.tick_count += 1;

        let mut finished = false;
        if let Some(broadcaster) = self.broadcaster.as_mut() {
            for notice in broadcaster.emit(now, interval, &mut self.source) {
                match notice {
                    BroadcasterNotice::SourceChanged { source_id } => {
                        self.events.emit_playback(PlaybackEvent::SourceChanged {
                            channel_id: self.id.clone(),
                            new_source_id: source_id,
                        });
                    }
                    BroadcasterNotice::Finished => finished = true,
                }
            }
        }
        if finished {
            self.broadcaster = None;
            self.state = ChannelState::Stop;
            log::info!("[Channel] {} stream finished", self.id);
            self.events.emit_playback(PlaybackEvent::Finished {
                channel_id: self.id.clone(),
            });
        }

        if self.tick_count % PROGRESS_TICK_MULTIPLE == 0 {
            if let Some((source_id, progress_ms)) =
                self.broadcaster.as_ref().and_then(|b| b.progress())
            {
                let duration_ms = self.source.source_duration_ms(&source_id);
                self.events.emit_playback(PlaybackEvent::SourceProgress {
                    channel_id: self.id.clone(),
                    source_id,
                    progress_ms,
                    duration_ms,
                });
            }
            self.sweep_offline(now);
        }
    }

    /// Marks receivers whose sync went stale as offline. They stay in the
    /// set; reconnection is the receiver's responsibility.
    fn sweep_offline(&mut self, now: u64) {
        let window = self.sync.offline_after_us();
        for receiver in self.receivers.values_mut() {
            if receiver.is_online() && receiver.sync_stale(now, window) {
                receiver.mark_offline();
                log::warn!(
                    "[Channel] {} receiver {} missed sync, marking offline",
                    self.id,
                    receiver.id()
                );
                self.events.emit_receiver(ReceiverEvent::Offline {
                    receiver_id: receiver.id().to_string(),
                });
            }
        }
    }

    /// Latency budget: worst receiver latency plus fixed headroom.
    /// Recomputed only on Play entry; late joiners accept the budget in
    /// force.
    fn broadcast_latency(&self) -> u64 {
        let worst = self
            .receivers
            .values()
            .map(Receiver::latency)
            .max()
            .unwrap_or(0);
        worst + self.config.buffer_latency_us
    }

    fn send_control(&self, receiver: &Receiver, message: ControlMessage) {
        let transport = receiver.transport();
        let receiver_id = receiver.id().to_string();
        let frame = message.encode();
        tokio::spawn(async move {
            if let Err(e) = transport.send(frame).await {
                log::warn!("[Channel] Control send to {} failed: {}", receiver_id, e);
            }
        });
    }

    fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            state: self.state,
            receivers: self.receivers.values().map(Receiver::status).collect(),
            broadcasting: self.broadcaster.is_some(),
            packets_dispatched: self.broadcaster.as_ref().map(Broadcaster::packet_number),
        }
    }

    fn cleanup(&mut self) {
        let now = self.clock.now();
        if let Some(mut broadcaster) = self.broadcaster.take() {
            broadcaster.stop(StopReason::Normal, now, &mut self.source);
        }
        for receiver in self.receivers.values() {
            self.send_control(receiver, ControlMessage::Stop);
        }
        self.emitter.stop();
        self.registry.unregister_channel(&self.id);
        log::info!("[Channel] {} terminated", self.id);
    }
}
