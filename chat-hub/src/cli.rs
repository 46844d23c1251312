use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::hub::HubConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the hub, rebroadcasting every message to all connected clients.
    Serve(ServeArgs),
    /// Connect to a hub and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the hub should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Messages buffered on the broadcast channel before senders wait.
    #[arg(long, default_value_t = 128)]
    pub broadcast_capacity: usize,

    /// Received messages each client may have queued for the hub; extra
    /// messages are dropped while the hub is congested.
    #[arg(long, default_value_t = 1024)]
    pub handoff_capacity: usize,
}

impl ServeArgs {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            broadcast_capacity: self.broadcast_capacity,
            handoff_capacity: self.handoff_capacity,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Name attached to every message this client sends.
    #[arg(long)]
    pub name: String,

    /// Address of the hub to connect to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub server: SocketAddr,
}
