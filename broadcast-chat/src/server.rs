use std::{future::Future, net::SocketAddr};

use anyhow::{Context, Result};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
};
use tracing::{info, warn};

use crate::{config::ServerConfig, handler::handle_connection, hub::Hub};

/// Accepts TCP clients and hands each one to its own connection handler.
pub struct Server {
    listener: TcpListener,
    hub: Hub<OwnedWriteHalf>,
    max_line_length: usize,
}

impl Server {
    /// Wraps an already bound listener and starts the hub worker. Must be
    /// called from within a Tokio runtime.
    pub fn new(listener: TcpListener, config: &ServerConfig) -> Self {
        Self {
            listener,
            hub: Hub::spawn(&config.hub),
            max_line_length: config.max_line_length,
        }
    }

    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self::new(listener, config))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> Hub<OwnedWriteHalf> {
        self.hub.clone()
    }

    /// Accepts connections until `shutdown` resolves. Connections that are
    /// already running keep going.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            hub,
            max_line_length,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server no longer accepting connections");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &hub, max_line_length);
                }
            }
        }

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

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    hub: &Hub<OwnedWriteHalf>,
    max_line_length: usize,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, hub, max_line_length),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    hub: &Hub<OwnedWriteHalf>,
    max_line_length: usize,
) {
    let hub = hub.clone();
    tokio::spawn(async move {
        let (reader, writer) = stream.into_split();
        let reader = BufReader::new(reader);
        if let Err(err) = handle_connection(hub, peer, reader, writer, max_line_length).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}
