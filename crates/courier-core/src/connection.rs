//! Transport collaborator seam.
//!
//! The core never terminates sockets itself; it holds connection handles
//! behind this trait and writes whole frames through them.

use async_trait::async_trait;
use courier_protocol::Message;
use thiserror::Error;

/// Connection errors surfaced to the core.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connection was closed.
    #[error("Connection closed")]
    Closed,

    /// Failed to write a frame.
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// A live, writable connection to one client.
///
/// Implementations must serialize writes internally: at most one frame may be
/// in flight per connection, and the write lock is held for the duration of
/// one frame write only, never across a network round-trip. Multiple core
/// components (the owning read task, retry timers, broadcasts from other
/// connections' tasks) send through the same handle concurrently.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Write one frame to the peer.
    async fn send(&self, message: &Message) -> Result<(), ConnectionError>;

    /// Whether the connection can still accept writes.
    fn is_open(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), ConnectionError>;
}
