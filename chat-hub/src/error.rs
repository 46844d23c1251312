use std::io;

use thiserror::Error;

/// Failures returned by [`Hub`](crate::hub::Hub) operations.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub has shut down and no longer dispatches messages")]
    Stopped,
}

/// Terminal outcome of a client session, surfaced to the transport for logging.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to receive from client")]
    Receive(#[source] io::Error),
    #[error("hub has shut down; session rejected")]
    HubStopped,
}
