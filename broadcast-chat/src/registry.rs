//! Connection registry shared by every connection handler and the hub worker.
//!
//! The registry maps a [`ConnectionId`] to the [`ClientEntry`] for that
//! connection. All mutation goes through one `tokio::sync::Mutex`, so
//! registration, deregistration and fan-out iteration are serialised.
//! The lock is never re-entrant: code holding a [`RegistryGuard`] must not
//! call back into the registry.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex, MutexGuard, Notify},
};

/// Identity of one accepted connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),
}

/// Handed to the registering handler; resolves once the hub has evicted
/// the client after a failed or timed-out write.
#[derive(Debug, Clone)]
pub struct Eviction(Arc<Notify>);

// Test-only: lets tests compare `Result<Eviction, RegistryError>` values.
#[cfg(test)]
impl PartialEq for Eviction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eviction {
    pub async fn notified(&self) {
        self.0.notified().await;
    }
}

/// A registered client: its display identifier plus the write half of its
/// connection. Only the hub writes through `writer`.
pub struct ClientEntry<W> {
    identifier: String,
    writer: W,
    broken: bool,
    eviction: Arc<Notify>,
}

impl<W> ClientEntry<W> {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// True once a write to this client failed or timed out.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Stops further writes to this client and wakes its handler, which
    /// then deregisters it. The entry itself stays until that happens.
    pub(crate) fn evict(&mut self) {
        if !self.broken {
            self.broken = true;
            self.eviction.notify_one();
        }
    }

    pub fn into_writer(self) -> W {
        self.writer
    }
}

impl<W> ClientEntry<W>
where
    W: AsyncWrite + Unpin,
{
    /// Writes an already framed line and flushes it.
    pub async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await
    }
}

pub struct Registry<W> {
    clients: Mutex<HashMap<ConnectionId, ClientEntry<W>>>,
    next_id: AtomicU64,
}

impl<W> Default for Registry<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> Registry<W> {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Inserts `id → identifier`. Registering an id twice is rejected and
    /// leaves the existing entry untouched.
    pub async fn register(
        &self,
        id: ConnectionId,
        identifier: impl Into<String>,
        writer: W,
    ) -> Result<Eviction, RegistryError> {
        let mut clients = self.clients.lock().await;
        if clients.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        let eviction = Arc::new(Notify::new());
        clients.insert(
            id,
            ClientEntry {
                identifier: identifier.into(),
                writer,
                broken: false,
                eviction: Arc::clone(&eviction),
            },
        );
        Ok(Eviction(eviction))
    }

    /// Removes the entry for `id`, handing it back to the caller. Removing an
    /// absent id is a no-op.
    pub async fn unregister(&self, id: ConnectionId) -> Option<ClientEntry<W>> {
        let mut clients = self.clients.lock().await;
        clients.remove(&id)
    }

    /// Acquires the registry lock. Every entry visited through the guard is
    /// registered for as long as the guard lives.
    pub async fn lock(&self) -> RegistryGuard<'_, W> {
        RegistryGuard {
            clients: self.clients.lock().await,
        }
    }

    /// Number of registered clients.
    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, id: ConnectionId) -> bool {
        self.clients.lock().await.contains_key(&id)
    }

    #[cfg(test)]
    pub(crate) async fn identifiers(&self) -> Vec<String> {
        let clients = self.clients.lock().await;
        let mut identifiers: Vec<String> = clients
            .values()
            .map(|entry| entry.identifier.clone())
            .collect();
        identifiers.sort();
        identifiers
    }
}

/// Exclusive access to the registry for the duration of a fan-out.
pub struct RegistryGuard<'a, W> {
    clients: MutexGuard<'a, HashMap<ConnectionId, ClientEntry<W>>>,
}

impl<W> RegistryGuard<'_, W> {
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConnectionId, &mut ClientEntry<W>)> {
        self.clients.iter_mut().map(|(id, entry)| (*id, entry))
    }
}
