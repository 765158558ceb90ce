//! The message channel shared by chat and call signaling.
//!
//! A channel carries discrete frames between the two members of one chat
//! room. Implementations hand back an event receiver alongside the channel,
//! the same way a transport factory does.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use wirecore::ParticipantId;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),
}

/// An event produced by the channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Connected,
    /// One complete frame from the room.
    Frame(Bytes),
    Disconnected,
}

/// An open, bidirectional message channel.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Sends one frame to the room.
    async fn send(&self, frame: &[u8]) -> Result<(), ChannelError>;

    fn is_open(&self) -> bool;

    /// Closes the connection.
    async fn close(&self);
}

/// Opens a channel to the room shared with `remote_id`.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open(
        &self,
        remote_id: ParticipantId,
    ) -> Result<(Arc<dyn MessageChannel>, mpsc::Receiver<ChannelEvent>), ChannelError>;
}
