//! Channel-side receiver state.
//!
//! A receiver is a remote speaker endpoint with its own clock, latency and
//! volume. The device itself lives across the network; this module holds
//! the channel's view of it: identity, latency estimate, online flag,
//! volume, and the transport packets travel on. The clock-alignment
//! protocol both ends speak is in [`sync`].

pub mod sync;

use std::sync::Arc;

use serde::Serialize;

use crate::transport::Transport;

/// Opaque receiver identifier, owned by the external persistence layer.
pub type ReceiverId = String;

/// One remote speaker, as the channel tracks it.
pub struct Receiver {
    id: ReceiverId,
    transport: Arc<dyn Transport>,
    latency_us: u64,
    online: bool,
    volume: f32,
    /// Clock time of the last sync report; receivers silent for longer
    /// than the sync staleness window go offline.
    last_sync_at: Option<u64>,
}

/// Snapshot of a receiver for reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStatus {
    /// Receiver identity.
    pub receiver_id: ReceiverId,
    /// Current latency estimate (µs).
    pub latency_us: u64,
    /// Whether sync is live.
    pub online: bool,
    /// Volume in [0.0, 1.0].
    pub volume: f32,
}

impl Receiver {
    /// Creates a receiver record at attach time.
    ///
    /// The receiver starts online; it must keep syncing to stay that way.
    #[must_use]
    pub fn new(id: impl Into<ReceiverId>, transport: Arc<dyn Transport>, now: u64) -> Self {
        Self {
            id: id.into(),
            transport,
            latency_us: 0,
            online: true,
            volume: 1.0,
            last_sync_at: Some(now),
        }
    }

    /// Receiver identity.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current end-to-end latency estimate (µs).
    #[must_use]
    pub fn latency(&self) -> u64 {
        self.latency_us
    }

    /// The transport packets and control frames travel on.
    #[must_use]
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Whether the receiver is currently syncing.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Volume in [0.0, 1.0].
    #[must_use]
    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Sets the volume, clamped to [0.0, 1.0].
    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
    }

    /// Records a sync report. Returns `true` when this brought the
    /// receiver back online.
    pub fn record_sync(&mut self, latency_us: u64, now: u64) -> bool {
        self.latency_us = latency_us;
        self.last_sync_at = Some(now);
        let recovered = !self.online;
        self.online = true;
        recovered
    }

    /// Marks the receiver offline. Returns `true` when the flag changed.
    pub fn mark_offline(&mut self) -> bool {
        let changed = self.online;
        self.online = false;
        changed
    }

    /// Whether the last sync report is older than `window_us`.
    #[must_use]
    pub fn sync_stale(&self, now: u64, window_us: u64) -> bool {
        match self.last_sync_at {
            Some(at) => now.saturating_sub(at) > window_us,
            None => true,
        }
    }

    /// Snapshot for reporting.
    #[must_use]
    pub fn status(&self) -> ReceiverStatus {
        ReceiverStatus {
            receiver_id: self.id.clone(),
            latency_us: self.latency_us,
            online: self.online,
            volume: self.volume,
        }
    }
}
