//! Per-client session state.
//!
//! A [`Connection`] pairs two independent loops over one client stream:
//!
//! - the **send loop** drains the connection's outbound queue onto the stream,
//! - the **receive loop** reads the stream and hands each message to the hub.
//!
//! Both loops watch the same termination flag, so [`Connection::close`] stops
//! them without waiting for the stream to fail. The outbound queue is
//! unbounded: a slow reader grows its own queue instead of stalling the hub.
//! The inbound handoff is bounded by [`DEFAULT_HANDOFF_CAPACITY`] unless the
//! hub configures otherwise; overflow is dropped, never waited on.

use std::{fmt, io, sync::Arc};

use tokio::{
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
};
use tracing::{debug, trace, warn};

use crate::{
    hub::Dispatcher,
    message::ChatMessage,
    transport::{MessageSink, MessageSource},
};

/// Runtime identity of a connection, used only for registry membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Received messages a connection holds while waiting for the hub.
pub const DEFAULT_HANDOFF_CAPACITY: usize = 1024;

/// Receiving end of a connection's outbound queue, consumed by the send loop.
pub type OutboundQueue = mpsc::UnboundedReceiver<Arc<ChatMessage>>;

pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Arc<ChatMessage>>,
    terminated: watch::Sender<bool>,
    handoff_capacity: usize,
}

impl Connection {
    pub fn new(id: ConnectionId) -> (Arc<Self>, OutboundQueue) {
        Self::with_handoff_capacity(id, DEFAULT_HANDOFF_CAPACITY)
    }

    pub fn with_handoff_capacity(id: ConnectionId, capacity: usize) -> (Arc<Self>, OutboundQueue) {
        let (outbound, queue) = mpsc::unbounded_channel();
        let (terminated, _) = watch::channel(false);
        let connection = Arc::new(Self {
            id,
            outbound,
            terminated,
            handoff_capacity: capacity.max(1),
        });
        (connection, queue)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        *self.terminated.borrow()
    }

    /// Queues a message for the send loop. Does nothing once the connection
    /// is closed; callers fanning out to many peers never see a dead one.
    pub fn enqueue(&self, message: Arc<ChatMessage>) {
        if self.is_closed() {
            return;
        }
        // The send loop may exit between the check and the send. The message
        // is then dropped together with the queue.
        let _ = self.outbound.send(message);
    }

    /// Marks the connection terminated and wakes both loops.
    ///
    /// Safe to call any number of times from any task. Returns `true` only for
    /// the single call that actually performed the termination.
    pub fn close(&self) -> bool {
        let closed_now = self.terminated.send_if_modified(|terminated| {
            if *terminated {
                false
            } else {
                *terminated = true;
                true
            }
        });
        if closed_now {
            debug!(connection = %self.id, "connection closed");
        }
        closed_now
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        let mut terminated = self.terminated.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = terminated.wait_for(|terminated| *terminated).await;
    }

    /// Writes queued messages to `sink` until the connection closes.
    ///
    /// A write failure closes the connection and is returned as-is; there is
    /// no retry. Dropping `queue` on exit releases anything still buffered.
    pub async fn run_send_loop<S>(
        self: Arc<Self>,
        mut queue: OutboundQueue,
        mut sink: S,
    ) -> io::Result<()>
    where
        S: MessageSink,
    {
        loop {
            let message = select! {
                biased;
                _ = self.closed() => break,
                next = queue.recv() => match next {
                    Some(message) => message,
                    None => break,
                },
            };

            select! {
                biased;
                _ = self.closed() => break,
                written = sink.send(&message) => {
                    if let Err(err) = written {
                        self.close();
                        return Err(err);
                    }
                }
            }
        }

        Ok(())
    }

    /// Reads `source` until end-of-stream, a read error, or closure, handing
    /// each message to `dispatcher`.
    ///
    /// Handoff goes through a bounded per-connection queue drained by one
    /// forwarder task. A congested hub never stalls reads and per-sender order
    /// is kept; once the queue is full, newly read messages are dropped.
    ///
    /// On end-of-stream the queue is drained into the hub before the
    /// connection closes. On a read error or an explicit close, whatever is
    /// still queued is dropped. The connection is always closed when this
    /// returns.
    pub async fn run_receive_loop<S>(
        self: &Arc<Self>,
        mut source: S,
        dispatcher: Dispatcher,
    ) -> io::Result<()>
    where
        S: MessageSource,
    {
        let (handoff, pending) = mpsc::channel(self.handoff_capacity);
        let forwarder = tokio::spawn(Arc::clone(self).forward_inbound(pending, dispatcher));

        let (outcome, drain) = loop {
            select! {
                biased;
                _ = self.closed() => break (Ok(()), false),
                inbound = source.receive() => match inbound {
                    Ok(Some(message)) => self.hand_off(&handoff, message),
                    Ok(None) => break (Ok(()), true),
                    Err(err) => break (Err(err), false),
                },
            }
        };

        if !drain {
            self.close();
        }
        drop(handoff);
        if let Err(err) = forwarder.await {
            warn!(connection = %self.id, error = ?err, "handoff forwarder failed");
        }
        self.close();

        outcome
    }

    fn hand_off(&self, handoff: &mpsc::Sender<ChatMessage>, message: ChatMessage) {
        trace!(connection = %self.id, sender = %message.sender, "message received");
        match handoff.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                warn!(connection = %self.id, sender = %message.sender, "hub congested; inbound message dropped");
            }
            // The forwarder already gave up on the hub.
            Err(TrySendError::Closed(_)) => {}
        }
    }

    async fn forward_inbound(
        self: Arc<Self>,
        mut pending: mpsc::Receiver<ChatMessage>,
        dispatcher: Dispatcher,
    ) {
        loop {
            let message = select! {
                biased;
                _ = self.closed() => break,
                next = pending.recv() => match next {
                    Some(message) => message,
                    None => break,
                },
            };

            select! {
                biased;
                _ = self.closed() => {
                    debug!(connection = %self.id, "connection closed with handoff pending; message dropped");
                    break;
                }
                dispatched = dispatcher.dispatch(message) => {
                    if let Err(err) = dispatched {
                        debug!(connection = %self.id, error = %err, "inbound messages dropped");
                        break;
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
