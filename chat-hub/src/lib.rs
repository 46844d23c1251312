//! Real-time chat fan-out hub.
//!
//! Clients connect over any duplex message stream; every message a client
//! sends is rebroadcast to all connected clients, the sender included. Slow
//! or broken clients only affect themselves.
//!
//! - [`message`] defines the chat message and its JSON-lines framing.
//! - [`transport`] holds the stream capabilities the hub relies on, plus TCP
//!   and in-memory implementations.
//! - [`connection`] runs one client's send and receive loops.
//! - [`hub`] keeps the registry of live connections and fans messages out.
//! - [`server`] accepts TCP clients and hands them to the hub.
//! - [`cli`] and [`client`] back the `chat-hub` binary.

pub mod cli;
pub mod client;
pub mod connection;
pub mod error;
pub mod hub;
pub mod message;
pub mod server;
pub mod transport;

pub use connection::{Connection, ConnectionId};
pub use error::{HubError, SessionError};
pub use hub::{DispatchLoop, Dispatcher, Hub, HubConfig};
pub use message::ChatMessage;
