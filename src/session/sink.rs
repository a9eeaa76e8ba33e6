//! Outbound side of a conversation's message channel.
//!
//! The protocol engine never touches a socket directly. It writes serialized frames to
//! a [`MessageSink`]; the websocket actor implements it by queueing the frame on its own
//! context, which gives a single writer per socket no matter how many tasks (protocol
//! loop, delayed deliveries, echo flush) send concurrently.

use crate::error::SendError;
use async_trait::async_trait;

#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Write one text frame. Resolves once the transport accepted the frame.
    async fn deliver(&self, frame: String) -> Result<(), SendError>;

    /// Close the channel after every frame already delivered.
    fn close(&self);
}
