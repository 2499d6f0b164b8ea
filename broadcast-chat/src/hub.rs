//! Broadcast hub: the single serialisation point for outbound fan-out.
//!
//! Connection handlers hold a cloneable [`Hub`] handle and submit
//! [`Message`] events into a bounded `mpsc` queue. Exactly one
//! [`HubWorker`] drains that queue, so the order in which events are
//! enqueued is the order in which every recipient sees them.
//!
//! For each event the worker locks the [`Registry`] and writes the content
//! to every registered connection except the sender, holding the lock
//! across the writes. A slow reader therefore delays delivery to everyone
//! else; `write_timeout` caps how long one recipient can stall a fan-out.
//! A failed or timed-out write evicts the recipient: it is skipped from then
//! on and its handler is woken to deregister it. Only that handler removes
//! the entry, so the usual leave notice follows.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{io::AsyncWrite, sync::mpsc, time::timeout};
use tracing::{debug, info};

use crate::{
    config::HubConfig,
    protocol::encode_line,
    registry::{ConnectionId, Registry},
};

/// One broadcast event. `sender` is the connection excluded from delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: ConnectionId,
    pub content: String,
}

impl Message {
    pub fn new(sender: ConnectionId, content: impl Into<String>) -> Self {
        Self {
            sender,
            content: content.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("broadcast hub is no longer running")]
    Closed,
}

#[derive(Debug, Default)]
pub struct HubStats {
    events: AtomicU64,
    deliveries: AtomicU64,
    failed_deliveries: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Events fully fanned out by the worker.
    pub events: u64,
    pub deliveries: u64,
    pub failed_deliveries: u64,
}

impl HubStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events: self.events.load(Ordering::Acquire),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            failed_deliveries: self.failed_deliveries.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the hub, shared by the acceptor and every connection handler.
pub struct Hub<W> {
    registry: Arc<Registry<W>>,
    events: mpsc::Sender<Message>,
    stats: Arc<HubStats>,
}

impl<W> Clone for Hub<W> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<W> Hub<W> {
    /// Builds the handle and its worker. The worker does nothing until
    /// [`HubWorker::run`] is polled.
    pub fn new(config: &HubConfig) -> (Self, HubWorker<W>) {
        let (events, inbox) = mpsc::channel(config.queue_capacity.max(1));
        let registry = Arc::new(Registry::new());
        let stats = Arc::new(HubStats::default());

        let hub = Self {
            registry: Arc::clone(&registry),
            events,
            stats: Arc::clone(&stats),
        };
        let worker = HubWorker {
            registry,
            inbox,
            stats,
            write_timeout: config.write_timeout,
        };
        (hub, worker)
    }

    pub fn registry(&self) -> &Registry<W> {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Enqueues an event for fan-out, waiting for queue capacity when the
    /// queue is full.
    pub async fn submit(&self, message: Message) -> Result<(), HubError> {
        self.events.send(message).await.map_err(|_| HubError::Closed)
    }
}

impl<W> Hub<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Builds the hub and runs its worker on the current Tokio runtime.
    pub fn spawn(config: &HubConfig) -> Self {
        let (hub, worker) = Self::new(config);
        tokio::spawn(worker.run());
        hub
    }
}

/// Sole consumer of the hub's event queue.
pub struct HubWorker<W> {
    registry: Arc<Registry<W>>,
    inbox: mpsc::Receiver<Message>,
    stats: Arc<HubStats>,
    write_timeout: Duration,
}

impl<W> HubWorker<W>
where
    W: AsyncWrite + Unpin,
{
    /// Drains the queue until every [`Hub`] handle has been dropped.
    pub async fn run(self) {
        let HubWorker {
            registry,
            mut inbox,
            stats,
            write_timeout,
        } = self;
        let fan_out = FanOut {
            registry,
            stats,
            write_timeout,
        };

        while let Some(message) = inbox.recv().await {
            fan_out.dispatch(message).await;
        }
        info!("broadcast hub stopped");
    }
}

struct FanOut<W> {
    registry: Arc<Registry<W>>,
    stats: Arc<HubStats>,
    write_timeout: Duration,
}

impl<W> FanOut<W>
where
    W: AsyncWrite + Unpin,
{
    async fn dispatch(&self, message: Message) {
        let frame = encode_line(&message.content);
        let mut delivered = 0u64;
        let mut failed = 0u64;

        let mut clients = self.registry.lock().await;
        for (id, entry) in clients.iter_mut() {
            if id == message.sender || entry.is_broken() {
                continue;
            }

            match timeout(self.write_timeout, entry.write_frame(&frame)).await {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(error)) => {
                    debug!(client = entry.identifier(), ?error, "failed to deliver line");
                    entry.evict();
                    failed += 1;
                }
                Err(_) => {
                    debug!(
                        client = entry.identifier(),
                        timeout = ?self.write_timeout,
                        "timed out delivering line"
                    );
                    entry.evict();
                    failed += 1;
                }
            }
        }
        drop(clients);

        self.stats.deliveries.fetch_add(delivered, Ordering::Relaxed);
        self.stats
            .failed_deliveries
            .fetch_add(failed, Ordering::Relaxed);
        self.stats.events.fetch_add(1, Ordering::Release);
        debug!(sender = %message.sender, delivered, failed, "fanned out event");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{BufReader, DuplexStream, duplex};

    use super::*;
    use crate::protocol::read_line;

    fn config() -> HubConfig {
        HubConfig {
            queue_capacity: 16,
            write_timeout: Duration::from_millis(200),
        }
    }

    async fn wait_for_events(hub: &Hub<DuplexStream>, events: u64) {
        timeout(Duration::from_secs(2), async {
            while hub.stats().events < events {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("hub should drain the queue");
    }

    async fn join(
        hub: &Hub<DuplexStream>,
        identifier: &str,
    ) -> (ConnectionId, BufReader<DuplexStream>) {
        let (writer, peer) = duplex(1024);
        let id = hub.registry().next_id();
        hub.registry()
            .register(id, identifier, writer)
            .await
            .expect("register");
        (id, BufReader::new(peer))
    }

    async fn next_line(reader: &mut BufReader<DuplexStream>) -> String {
        timeout(Duration::from_secs(1), read_line(reader, 1024))
            .await
            .expect("line should arrive")
            .expect("read line")
            .expect("stream open")
    }

    #[tokio::test]
    async fn sender_never_receives_its_own_message() {
        let hub = Hub::spawn(&config());
        let (alice, mut alice_rx) = join(&hub, "alice").await;
        let (_bob, mut bob_rx) = join(&hub, "bob").await;

        hub.submit(Message::new(alice, "User [alice]: hello"))
            .await
            .unwrap();
        wait_for_events(&hub, 1).await;

        assert_eq!(next_line(&mut bob_rx).await, "User [alice]: hello");
        let nothing = timeout(Duration::from_millis(50), read_line(&mut alice_rx, 1024)).await;
        assert!(nothing.is_err(), "alice must not see her own message");
        assert_eq!(
            hub.stats(),
            StatsSnapshot {
                events: 1,
                deliveries: 1,
                failed_deliveries: 0
            }
        );
    }

    #[tokio::test]
    async fn events_are_delivered_in_enqueue_order() {
        let hub = Hub::spawn(&config());
        let (alice, _alice_rx) = join(&hub, "alice").await;
        let (bob, _bob_rx) = join(&hub, "bob").await;
        let (_carol, mut carol_rx) = join(&hub, "carol").await;

        for n in 0..10 {
            let sender = if n % 2 == 0 { alice } else { bob };
            hub.submit(Message::new(sender, format!("line {n}")))
                .await
                .unwrap();
        }

        for n in 0..10 {
            assert_eq!(next_line(&mut carol_rx).await, format!("line {n}"));
        }
    }

    #[tokio::test]
    async fn failed_recipient_does_not_abort_fan_out_or_leave_registry() {
        let hub = Hub::spawn(&config());
        let (sender, _sender_rx) = join(&hub, "sender").await;
        let (gone, gone_rx) = join(&hub, "gone").await;
        let (_ok, mut ok_rx) = join(&hub, "ok").await;
        drop(gone_rx);

        hub.submit(Message::new(sender, "first")).await.unwrap();
        hub.submit(Message::new(sender, "second")).await.unwrap();
        wait_for_events(&hub, 2).await;

        assert_eq!(next_line(&mut ok_rx).await, "first");
        assert_eq!(next_line(&mut ok_rx).await, "second");
        assert!(hub.registry().contains(gone).await);
        let stats = hub.stats();
        assert_eq!(stats.deliveries, 2);
        assert_eq!(stats.failed_deliveries, 1);
    }

    #[tokio::test]
    async fn wedged_recipient_is_bounded_by_write_timeout() {
        let hub = Hub::spawn(&HubConfig {
            queue_capacity: 4,
            write_timeout: Duration::from_millis(50),
        });
        let (sender, _sender_rx) = join(&hub, "sender").await;

        // Nobody reads from this peer, and its buffer is smaller than a line.
        let (wedged_writer, _wedged_peer) = duplex(4);
        let wedged = hub.registry().next_id();
        let eviction = hub
            .registry()
            .register(wedged, "wedged", wedged_writer)
            .await
            .unwrap();
        let (_ok, mut ok_rx) = join(&hub, "ok").await;

        hub.submit(Message::new(sender, "a line longer than four bytes"))
            .await
            .unwrap();
        wait_for_events(&hub, 1).await;

        assert_eq!(next_line(&mut ok_rx).await, "a line longer than four bytes");
        assert_eq!(hub.stats().failed_deliveries, 1);
        timeout(Duration::from_secs(1), eviction.notified())
            .await
            .expect("wedged recipient should be evicted");
    }

    #[tokio::test]
    async fn submit_fails_once_worker_is_gone() {
        let (hub, worker) = Hub::<DuplexStream>::new(&config());
        drop(worker);

        let sender = hub.registry().next_id();
        let result = hub.submit(Message::new(sender, "late")).await;
        assert_eq!(result, Err(HubError::Closed));
    }
}
