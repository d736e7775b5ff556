//! Centralized error types for the broadcasting core.
//!
//! Transport and source failures are handled locally (logged, receiver
//! marked offline, silent frame substituted) and never surface here; the
//! variants below are the structural failures callers must handle.

use serde::Serialize;
use thiserror::Error;

/// Application-wide error type for the broadcasting core.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum CoreError {
    /// Skip target does not exist in the channel's source list.
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// Receiver is already attached to another channel.
    #[error("Receiver {0} is already attached to channel {1}")]
    ReceiverAttached(String, String),

    /// Receiver is not a member of this channel.
    #[error("Receiver not found: {0}")]
    ReceiverNotFound(String),

    /// Channel id not present in the registry.
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// The channel actor is gone; its command queue is closed.
    #[error("Channel closed")]
    ChannelClosed,

    /// Configuration failed validation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A peer violated the wire protocol (duplicate playback timestamp,
    /// malformed sync frame).
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}

impl CoreError {
    /// Returns a machine-readable error code for external reporting.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownSource(_) => "unknown_source",
            Self::ReceiverAttached(_, _) => "receiver_attached",
            Self::ReceiverNotFound(_) => "receiver_not_found",
            Self::ChannelNotFound(_) => "channel_not_found",
            Self::ChannelClosed => "channel_closed",
            Self::Configuration(_) => "configuration_error",
            Self::ProtocolViolation(_) => "protocol_violation",
        }
    }
}

/// Convenient Result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
