//! Per-receiver transport abstraction.
//!
//! The scheduler assumes a reliable, order-preserving byte transport per
//! receiver (TCP on the LAN). Components depend on the [`Transport`] trait
//! rather than sockets, so tests substitute in-process channels.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;

/// One receiver's inbound wire.
///
/// Sends must preserve order per receiver; there is no cross-receiver
/// ordering requirement. Frames are length-prefixed (u32 BE) so the remote
/// end can reframe the byte stream.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers one frame. Errors are reported, never retried: audio frames
    /// go stale faster than a retry would help.
    async fn send(&self, frame: Bytes) -> io::Result<()>;

    /// Human-readable peer label for logs.
    fn peer(&self) -> String;
}

/// TCP transport writing length-prefixed frames to a receiver.
pub struct TcpTransport {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    peer: String,
}

impl TcpTransport {
    /// Wraps an established connection.
    ///
    /// The read half is the caller's: sync requests arrive there, so it is
    /// typically handed to [`serve_sync`](crate::receiver::sync::serve_sync)
    /// together with this transport.
    #[must_use]
    pub fn new(stream: TcpStream) -> (Self, tokio::net::tcp::OwnedReadHalf) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read, write) = stream.into_split();
        (
            Self {
                writer: tokio::sync::Mutex::new(write),
                peer,
            },
            read,
        )
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, frame: Bytes) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_u32(frame.len() as u32).await?;
        writer.write_all(&frame).await?;
        Ok(())
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// In-process transport backed by an unbounded channel.
///
/// Used in tests and for co-located receivers; consume the receiver end
/// to observe delivered frames.
pub struct ChannelTransport {
    tx: tokio::sync::mpsc::UnboundedSender<Bytes>,
    peer: String,
    /// When set, every send fails; used to exercise offline handling.
    failing: Mutex<bool>,
}

impl ChannelTransport {
    /// Creates the transport and the consuming end.
    #[must_use]
    pub fn new(peer: impl Into<String>) -> (Self, tokio::sync::mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                tx,
                peer: peer.into(),
                failing: Mutex::new(false),
            },
            rx,
        )
    }

    /// Makes every subsequent send fail with `BrokenPipe`.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: Bytes) -> io::Result<()> {
        if *self.failing.lock() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport down"));
        }
        self.tx
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver gone"))
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
