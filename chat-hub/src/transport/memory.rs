//! In-process transport backed by bounded tokio channels.
//!
//! [`pair`] returns the hub's end of the stream together with a [`MemoryPeer`]
//! that plays the remote client. The peer can also misbehave on purpose: it
//! can inject a read error, half-close its sending side, stop reading, or
//! drop its receiving side entirely.

use std::io;

use tokio::sync::mpsc;

use super::{MessageSink, MessageSource, MessageStream};
use crate::message::ChatMessage;

/// Creates a connected stream/peer pair. Each direction buffers at most
/// `capacity` messages before the writer has to wait.
pub fn pair(capacity: usize) -> (MemoryStream, MemoryPeer) {
    let capacity = capacity.max(1);
    let (to_hub, from_peer) = mpsc::channel(capacity);
    let (to_peer, from_hub) = mpsc::channel(capacity);

    let stream = MemoryStream {
        inbound: from_peer,
        outbound: to_peer,
    };
    let peer = MemoryPeer {
        to_hub: Some(to_hub),
        from_hub,
    };
    (stream, peer)
}

/// The hub's end of an in-memory connection.
pub struct MemoryStream {
    inbound: mpsc::Receiver<io::Result<ChatMessage>>,
    outbound: mpsc::Sender<ChatMessage>,
}

impl MessageStream for MemoryStream {
    type Source = MemorySource;
    type Sink = MemorySink;

    fn split(self) -> (Self::Source, Self::Sink) {
        (
            MemorySource {
                inbound: self.inbound,
            },
            MemorySink {
                outbound: self.outbound,
            },
        )
    }
}

pub struct MemorySource {
    inbound: mpsc::Receiver<io::Result<ChatMessage>>,
}

impl MessageSource for MemorySource {
    async fn receive(&mut self) -> io::Result<Option<ChatMessage>> {
        self.inbound.recv().await.transpose()
    }
}

pub struct MemorySink {
    outbound: mpsc::Sender<ChatMessage>,
}

impl MessageSink for MemorySink {
    async fn send(&mut self, message: &ChatMessage) -> io::Result<()> {
        self.outbound
            .send(message.clone())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer stopped receiving"))
    }
}

/// The remote client's end of an in-memory connection.
pub struct MemoryPeer {
    to_hub: Option<mpsc::Sender<io::Result<ChatMessage>>>,
    from_hub: mpsc::Receiver<ChatMessage>,
}

impl MemoryPeer {
    pub async fn send(&self, message: ChatMessage) -> io::Result<()> {
        self.push(Ok(message)).await
    }

    /// Makes the hub's next read fail with an error of the given kind.
    pub async fn fail(&self, kind: io::ErrorKind) -> io::Result<()> {
        self.push(Err(io::Error::new(kind, "injected read failure")))
            .await
    }

    /// Ends the peer's sending direction; the hub observes end-of-stream.
    pub fn close_send(&mut self) {
        self.to_hub = None;
    }

    /// Next message the hub delivered, or `None` once the hub side is gone.
    pub async fn recv(&mut self) -> Option<ChatMessage> {
        self.from_hub.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChatMessage> {
        self.from_hub.try_recv().ok()
    }

    /// Stops accepting deliveries, so the hub's next write fails.
    pub fn close_recv(&mut self) {
        self.from_hub.close();
    }

    async fn push(&self, item: io::Result<ChatMessage>) -> io::Result<()> {
        let Some(to_hub) = &self.to_hub else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "sending side already closed",
            ));
        };
        to_hub
            .send(item)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "hub stopped reading"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_messages_reach_source_then_eof() {
        let (stream, mut peer) = pair(4);
        let (mut source, _sink) = stream.split();

        peer.send(ChatMessage::new("alice", "one"))
            .await
            .expect("peer send");
        peer.close_send();

        let first = source.receive().await.expect("receive");
        assert_eq!(first, Some(ChatMessage::new("alice", "one")));
        assert!(source.receive().await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn injected_failure_surfaces_as_read_error() {
        let (stream, peer) = pair(4);
        let (mut source, _sink) = stream.split();

        peer.fail(io::ErrorKind::ConnectionReset)
            .await
            .expect("inject");
        let err = source.receive().await.expect_err("read should fail");
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn sink_fails_after_peer_closes_receiving_side() {
        let (stream, mut peer) = pair(4);
        let (_source, mut sink) = stream.split();

        peer.close_recv();
        let err = sink
            .send(&ChatMessage::new("hub", "lost"))
            .await
            .expect_err("send should fail");
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
