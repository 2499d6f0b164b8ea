//! Per-connection lifecycle: `Accepted → Registered → Reading → Deregistered`.
//!
//! A handler is the only reader of its connection and the only code that
//! adds or removes its registry entry. When the hub gives up writing to the
//! connection it wakes the handler, which then leaves through the same
//! deregistration path as a closed stream. It never writes to other clients;
//! everything it wants others to see goes through the [`Hub`].

use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt},
    select,
};
use tracing::{debug, info};

use crate::{
    hub::{Hub, Message},
    protocol::{chat_line, join_notice, leave_notice, read_line},
    registry::{ConnectionId, Eviction},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Registered,
    Reading,
    Deregistered,
}

pub struct ConnectionHandler<W> {
    hub: Hub<W>,
    id: ConnectionId,
    identifier: String,
    state: ConnectionState,
    eviction: Option<Eviction>,
}

impl<W> ConnectionHandler<W>
where
    W: AsyncWrite + Unpin,
{
    /// Creates a handler for a freshly accepted connection. The identifier
    /// is the remote endpoint and never changes afterwards.
    pub fn new(hub: Hub<W>, peer: SocketAddr) -> Self {
        let id = hub.registry().next_id();
        Self {
            hub,
            id,
            identifier: peer.to_string(),
            state: ConnectionState::Accepted,
            eviction: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Adds the connection to the registry and announces it to everyone else.
    pub async fn register(&mut self, writer: W) -> Result<()> {
        if self.state != ConnectionState::Accepted {
            bail!("connection {} registered twice", self.id);
        }

        let eviction = self
            .hub
            .registry()
            .register(self.id, self.identifier.clone(), writer)
            .await?;
        self.eviction = Some(eviction);
        self.transition(ConnectionState::Registered);
        info!(client = %self.identifier, connection = %self.id, "client joined");

        self.submit(join_notice(&self.identifier)).await
    }

    /// Relays lines until the peer closes the stream, a read fails or the hub
    /// evicts the connection. Empty lines are dropped.
    pub async fn read_loop<R>(&mut self, reader: &mut R, max_line_length: usize) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let eviction = match (&self.eviction, self.state) {
            (Some(eviction), ConnectionState::Registered) => eviction.clone(),
            _ => bail!("connection {} is not registered", self.id),
        };
        self.transition(ConnectionState::Reading);

        loop {
            let line = select! {
                line = read_line(reader, max_line_length) => line
                    .with_context(|| format!("failed to read from {}", self.identifier))?,
                () = eviction.notified() => {
                    bail!("stopped delivering to {}", self.identifier)
                }
            };

            match line {
                Some(text) if text.is_empty() => continue,
                Some(text) => self.submit(chat_line(&self.identifier, &text)).await?,
                None => return Ok(()),
            }
        }
    }

    /// Closes the connection, drops its registry entry and announces the
    /// departure. Calling it again is a no-op.
    pub async fn deregister(&mut self) {
        if self.state == ConnectionState::Deregistered {
            return;
        }
        let was_registered = self.state != ConnectionState::Accepted;
        self.transition(ConnectionState::Deregistered);

        if !was_registered {
            return;
        }

        self.eviction = None;
        if let Some(entry) = self.hub.registry().unregister(self.id).await {
            let mut writer = entry.into_writer();
            if let Err(error) = writer.shutdown().await {
                debug!(client = %self.identifier, ?error, "failed to close connection cleanly");
            }
        }

        info!(client = %self.identifier, connection = %self.id, "client left");
        if let Err(error) = self.submit(leave_notice(&self.identifier)).await {
            debug!(client = %self.identifier, ?error, "leave notice not delivered");
        }
    }

    async fn submit(&self, content: String) -> Result<()> {
        self.hub
            .submit(Message::new(self.id, content))
            .await
            .context("failed to submit broadcast event")
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(connection = %self.id, from = ?self.state, to = ?next, "state change");
        self.state = next;
    }
}

/// Runs the full lifecycle for one connection. Deregistration happens on
/// every exit path once registration succeeded.
pub async fn handle_connection<R, W>(
    hub: Hub<W>,
    peer: SocketAddr,
    mut reader: R,
    writer: W,
    max_line_length: usize,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut handler = ConnectionHandler::new(hub, peer);

    let session = match handler.register(writer).await {
        Ok(()) => handler.read_loop(&mut reader, max_line_length).await,
        Err(err) => Err(err),
    };
    handler.deregister().await;

    session
}
