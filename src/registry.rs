//! Process-wide registry of channels and receiver ownership.
//!
//! Actors address each other by stable id through this registry, never by
//! direct pointer. It also enforces the membership invariant that a
//! receiver belongs to at most one channel at a time.

use dashmap::DashMap;

use crate::channel::ChannelHandle;
use crate::error::{CoreError, CoreResult};
use crate::receiver::ReceiverId;

/// Channel identifier.
pub type ChannelId = String;

/// Registry of live channels and the receiver → channel ownership index.
#[derive(Default)]
pub struct Registry {
    channels: DashMap<ChannelId, ChannelHandle>,
    receiver_owner: DashMap<ReceiverId, ChannelId>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel handle under its id.
    pub fn register_channel(&self, handle: ChannelHandle) {
        self.channels.insert(handle.id().to_string(), handle);
    }

    /// Removes a channel and releases every receiver it owned.
    pub fn unregister_channel(&self, channel_id: &str) {
        self.channels.remove(channel_id);
        self.receiver_owner.retain(|_, owner| owner != channel_id);
    }

    /// Looks up a channel by id.
    pub fn channel(&self, channel_id: &str) -> CoreResult<ChannelHandle> {
        self.channels
            .get(channel_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::ChannelNotFound(channel_id.to_string()))
    }

    /// Snapshot of all registered channel handles.
    pub fn channels(&self) -> Vec<ChannelHandle> {
        self.channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Claims a receiver for a channel.
    ///
    /// # Errors
    ///
    /// `CoreError::ReceiverAttached` when another channel already owns it.
    /// Claiming again for the same channel is a no-op.
    pub fn claim_receiver(&self, receiver_id: &str, channel_id: &str) -> CoreResult<()> {
        match self.receiver_owner.entry(receiver_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                if entry.get() == channel_id {
                    Ok(())
                } else {
                    Err(CoreError::ReceiverAttached(
                        receiver_id.to_string(),
                        entry.get().clone(),
                    ))
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(channel_id.to_string());
                Ok(())
            }
        }
    }

    /// Releases a receiver if this channel owns it.
    pub fn release_receiver(&self, receiver_id: &str, channel_id: &str) {
        self.receiver_owner
            .remove_if(receiver_id, |_, owner| owner == channel_id);
    }

    /// The channel currently owning a receiver, if any.
    pub fn receiver_owner(&self, receiver_id: &str) -> Option<ChannelId> {
        self.receiver_owner
            .get(receiver_id)
            .map(|entry| entry.value().clone())
    }
}
