//! Persisted state interface.
//!
//! Playlists, receiver identities and volumes are owned by an external
//! storage layer; the core only reads on channel construction and writes
//! volume changes back. The [`StateStore`] trait is that boundary, with a
//! [`MemoryStore`] for embedding and tests.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::receiver::ReceiverId;
use crate::source::SourceId;

/// Load/save boundary to the external persistence layer.
pub trait StateStore: Send + Sync {
    /// Ordered source ids of a channel's playlist.
    fn load_playlist(&self, channel_id: &str) -> Vec<SourceId>;

    /// Persisted volume of a receiver, if any.
    fn load_volume(&self, receiver_id: &str) -> Option<f32>;

    /// Persists a receiver volume.
    fn save_volume(&self, receiver_id: &str, volume: f32);
}

/// In-memory store for embedding and tests.
#[derive(Default)]
pub struct MemoryStore {
    playlists: RwLock<HashMap<String, Vec<SourceId>>>,
    volumes: RwLock<HashMap<ReceiverId, f32>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a playlist.
    pub fn put_playlist(&self, channel_id: impl Into<String>, sources: Vec<SourceId>) {
        self.playlists.write().insert(channel_id.into(), sources);
    }
}

impl StateStore for MemoryStore {
    fn load_playlist(&self, channel_id: &str) -> Vec<SourceId> {
        self.playlists
            .read()
            .get(channel_id)
            .cloned()
            .unwrap_or_default()
    }

    fn load_volume(&self, receiver_id: &str) -> Option<f32> {
        self.volumes.read().get(receiver_id).copied()
    }

    fn save_volume(&self, receiver_id: &str, volume: f32) {
        self.volumes.write().insert(receiver_id.to_string(), volume);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volumes_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.load_volume("kitchen"), None);

        store.save_volume("kitchen", 0.4);
        assert_eq!(store.load_volume("kitchen"), Some(0.4));
    }

    #[test]
    fn missing_playlist_is_empty() {
        let store = MemoryStore::new();
        assert!(store.load_playlist("ghost").is_empty());

        store.put_playlist("living-room", vec!["a".into(), "b".into()]);
        assert_eq!(store.load_playlist("living-room").len(), 2);
    }
}
