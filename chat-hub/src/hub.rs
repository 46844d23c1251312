//! The fan-out hub: a registry of live connections plus one dispatch loop.
//!
//! Every inbound message goes through a single bounded broadcast channel. The
//! [`DispatchLoop`] is its only consumer. For each message it takes a snapshot
//! of the registry and enqueues the message on every member. Enqueueing never
//! blocks, so a stalled peer only grows its own queue.
//!
//! # Locking
//!
//! The registry is the only state behind a lock. Registration, removal, and
//! the per-message snapshot each take it briefly; delivery happens after the
//! lock is released.

use std::{
    collections::{HashMap, hash_map::Entry},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    select,
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    connection::{Connection, ConnectionId, DEFAULT_HANDOFF_CAPACITY},
    error::{HubError, SessionError},
    message::ChatMessage,
    transport::MessageStream,
};

const DEFAULT_BROADCAST_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Messages buffered on the broadcast channel before producers wait.
    pub broadcast_capacity: usize,
    /// Received messages a connection holds while the hub is congested.
    /// Anything beyond this is dropped instead of stalling reads.
    pub handoff_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            handoff_capacity: DEFAULT_HANDOFF_CAPACITY,
        }
    }
}

/// Cloneable handle to a running hub.
///
/// The dispatch loop ends on [`Hub::shutdown`], or once every `Hub` and
/// [`Dispatcher`] handle has been dropped.
#[derive(Clone)]
pub struct Hub {
    state: Arc<HubState>,
}

struct HubState {
    registry: Arc<Registry>,
    inbox: mpsc::Sender<ChatMessage>,
    shutdown: watch::Sender<bool>,
    next_id: AtomicU64,
    handoff_capacity: usize,
}

impl Hub {
    /// Creates a hub and the dispatch loop that serves it. Nothing is fanned
    /// out until [`DispatchLoop::run`] is driven.
    pub fn new(config: HubConfig) -> (Self, DispatchLoop) {
        let (inbox, receiver) = mpsc::channel(config.broadcast_capacity.max(1));
        let (shutdown, stopped) = watch::channel(false);
        let registry = Arc::new(Registry::default());

        let dispatch_loop = DispatchLoop {
            registry: Arc::clone(&registry),
            inbox: receiver,
            stopped,
        };
        let state = Arc::new(HubState {
            registry,
            inbox,
            shutdown,
            next_id: AtomicU64::new(1),
            handoff_capacity: config.handoff_capacity.max(1),
        });
        (Self { state }, dispatch_loop)
    }

    /// Creates a hub and spawns its dispatch loop on the current runtime.
    pub fn spawn(config: HubConfig) -> (Self, JoinHandle<()>) {
        let (hub, dispatch_loop) = Self::new(config);
        let handle = tokio::spawn(dispatch_loop.run());
        (hub, handle)
    }

    pub fn is_running(&self) -> bool {
        !*self.state.shutdown.borrow() && !self.state.inbox.is_closed()
    }

    /// Handle that connections use to feed the broadcast channel.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            inbox: self.state.inbox.clone(),
        }
    }

    pub async fn dispatch(&self, message: ChatMessage) -> Result<(), HubError> {
        self.dispatcher().dispatch(message).await
    }

    /// Adds `connection` to the registry. Registering the same id twice
    /// leaves the first entry in place.
    pub async fn register(&self, connection: Arc<Connection>) {
        let id = connection.id();
        let inserted = self
            .state
            .registry
            .with_connections(|connections| insert_once(connections, connection))
            .await;
        if !inserted {
            debug!(connection = %id, "connection already registered");
        }
    }

    /// Removes a connection from the registry; unknown ids are ignored.
    pub async fn deregister(&self, id: ConnectionId) {
        let removed = self
            .state
            .registry
            .with_connections(|connections| connections.remove(&id).is_some())
            .await;
        if !removed {
            trace!(connection = %id, "connection was not registered");
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.state
            .registry
            .with_connections(|connections| connections.len())
            .await
    }

    /// Ids of all registered connections, ordered by id.
    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        self.state
            .registry
            .with_connections(|connections| {
                let mut ids: Vec<_> = connections.keys().copied().collect();
                ids.sort_unstable();
                ids
            })
            .await
    }

    /// Serves one client stream from registration to deregistration.
    ///
    /// Returns once the client's receive loop ends. End-of-stream and
    /// locally triggered closes are `Ok`; a read error is returned for the
    /// transport to log.
    pub async fn handle_session<S>(&self, stream: S) -> Result<(), SessionError>
    where
        S: MessageStream,
    {
        let (connection, queue) =
            Connection::with_handoff_capacity(self.next_id(), self.state.handoff_capacity);
        let id = connection.id();

        // Checked under the registry lock, which `shutdown` also takes, so no
        // session can slip in after the hub has stopped.
        let admitted = self
            .state
            .registry
            .with_connections(|connections| {
                self.is_running() && insert_once(connections, Arc::clone(&connection))
            })
            .await;
        if !admitted {
            return Err(SessionError::HubStopped);
        }
        info!(connection = %id, "client connected");

        let (source, sink) = stream.split();
        let sender = tokio::spawn(Arc::clone(&connection).run_send_loop(queue, sink));
        let received = connection.run_receive_loop(source, self.dispatcher()).await;

        connection.close();
        self.deregister(id).await;

        match sender.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(connection = %id, error = ?err, "send loop failed"),
            Err(err) => warn!(connection = %id, error = ?err, "send loop task failed"),
        }
        info!(connection = %id, "client disconnected");

        received.map_err(SessionError::Receive)
    }

    /// Stops the dispatch loop and refuses new sessions. Open sessions are
    /// left to end on their own.
    pub async fn shutdown(&self) {
        let was_stopped = self
            .state
            .registry
            .with_connections(|_| self.state.shutdown.send_replace(true))
            .await;
        if !was_stopped {
            info!("hub shutting down");
        }
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId::new(self.state.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Producer side of the hub's broadcast channel.
#[derive(Clone)]
pub struct Dispatcher {
    inbox: mpsc::Sender<ChatMessage>,
}

impl Dispatcher {
    #[cfg(test)]
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChatMessage>) {
        let (inbox, receiver) = mpsc::channel(capacity);
        (Self { inbox }, receiver)
    }

    /// Waits for room on the broadcast channel, then hands `message` over.
    pub async fn dispatch(&self, message: ChatMessage) -> Result<(), HubError> {
        self.inbox
            .send(message)
            .await
            .map_err(|_| HubError::Stopped)
    }
}

/// The single consumer of the broadcast channel.
pub struct DispatchLoop {
    registry: Arc<Registry>,
    inbox: mpsc::Receiver<ChatMessage>,
    stopped: watch::Receiver<bool>,
}

impl DispatchLoop {
    pub async fn run(mut self) {
        debug!("dispatch loop started");

        loop {
            select! {
                biased;
                _ = wait_for_shutdown(&mut self.stopped) => break,
                next = self.inbox.recv() => match next {
                    Some(message) => self.fan_out(message).await,
                    // Every Hub and Dispatcher handle is gone.
                    None => break,
                },
            }
        }

        self.inbox.close();
        info!("dispatch loop stopped");
    }

    async fn fan_out(&self, message: ChatMessage) {
        let recipients = self.registry.snapshot().await;
        deliver_isolated(&recipients, Arc::new(message), Connection::enqueue);
    }
}

/// Hands `message` to every recipient. A panic while delivering to one
/// recipient is logged and the rest still get the message.
fn deliver_isolated<F>(recipients: &[Arc<Connection>], message: Arc<ChatMessage>, deliver: F)
where
    F: Fn(&Connection, Arc<ChatMessage>),
{
    for connection in recipients {
        let delivery = panic::catch_unwind(AssertUnwindSafe(|| {
            deliver(connection, Arc::clone(&message));
        }));
        if delivery.is_err() {
            warn!(connection = %connection.id(), "delivery panicked; recipient skipped");
        }
    }

    trace!(
        sender = %message.sender,
        recipients = recipients.len(),
        "message fanned out"
    );
}

async fn wait_for_shutdown(stopped: &mut watch::Receiver<bool>) {
    if stopped.wait_for(|stopped| *stopped).await.is_err() {
        // The hub state is gone; the inbox branch will observe the same.
        std::future::pending::<()>().await;
    }
}

fn insert_once(
    connections: &mut HashMap<ConnectionId, Arc<Connection>>,
    connection: Arc<Connection>,
) -> bool {
    match connections.entry(connection.id()) {
        Entry::Vacant(slot) => {
            slot.insert(connection);
            true
        }
        Entry::Occupied(_) => false,
    }
}

/// Live connections keyed by id. Every read and write goes through
/// [`Registry::with_connections`]; nothing is delivered while it is held.
#[derive(Default)]
struct Registry {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
}

impl Registry {
    async fn with_connections<R>(
        &self,
        f: impl FnOnce(&mut HashMap<ConnectionId, Arc<Connection>>) -> R,
    ) -> R {
        let mut connections = self.connections.lock().await;
        f(&mut connections)
    }

    async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.with_connections(|connections| connections.values().cloned().collect())
            .await
    }
}
