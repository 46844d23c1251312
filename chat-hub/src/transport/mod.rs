//! Capabilities a transport must provide so the hub can drive a session.
//!
//! The hub never looks at sockets or framing. It only needs a way to pull the
//! next inbound message and a way to push an outbound one, and it needs both
//! halves separately so the send and receive loops can run concurrently.

use std::{future::Future, io};

use crate::message::ChatMessage;

pub mod line;
pub mod memory;

/// Inbound half of a client stream.
pub trait MessageSource: Send + 'static {
    /// Resolves to `Ok(None)` once the peer has finished sending.
    fn receive(&mut self) -> impl Future<Output = io::Result<Option<ChatMessage>>> + Send;
}

/// Outbound half of a client stream.
pub trait MessageSink: Send + 'static {
    fn send(&mut self, message: &ChatMessage) -> impl Future<Output = io::Result<()>> + Send;
}

/// A duplex client stream that can be split into independently owned halves.
pub trait MessageStream: Send + 'static {
    type Source: MessageSource;
    type Sink: MessageSink;

    fn split(self) -> (Self::Source, Self::Sink);
}
