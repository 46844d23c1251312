use std::{future::Future, net::SocketAddr};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    hub::{Hub, HubConfig},
    transport::line::LineStream,
};

/// TCP front end: accepts sockets and hands each one to the hub as a session.
pub struct Server {
    listener: TcpListener,
    hub: Hub,
    dispatch: JoinHandle<()>,
}

impl Server {
    /// Must be called from within a Tokio runtime; the hub's dispatch loop is
    /// spawned immediately.
    pub fn new(listener: TcpListener, config: HubConfig) -> Self {
        let (hub, dispatch) = Hub::spawn(config);
        Self {
            listener,
            hub,
            dispatch,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            hub,
            dispatch,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &hub);
                }
            }
        }

        hub.shutdown().await;
        dispatch.await.context("dispatch loop task failed")?;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, hub: &Hub) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, hub),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, hub: &Hub) {
    let hub = hub.clone();
    tokio::spawn(async move {
        info!(peer = %peer, "accepted connection");
        if let Err(err) = hub.handle_session(LineStream::from_tcp(stream)).await {
            warn!(peer = %peer, error = ?err, "client session ended with error");
        }
    });
}
