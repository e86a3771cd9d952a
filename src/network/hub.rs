//! Event Hub
//!
//! Topic-based fan-out from game loops and request handlers to connected
//! clients.
//!
//! ```text
//!   publishers ──► HubHandle ──(unbounded cmd channel)──► HubDispatcher
//!                                                            │
//!                                  registry (RwLock<BTreeMap>)
//!                                                            │
//!                               try_send ──► per-connection mailbox ──► writer task
//! ```
//!
//! The dispatcher is the only task that mutates the registry, so publish,
//! subscribe and direct replies are applied in the order they were issued.
//! Publishing never blocks: the frame is serialized once on the caller's
//! side and the command is queued. A full mailbox drops the frame for that
//! subscriber only.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, trace};

use crate::core::ring::HistoryRing;
use crate::network::protocol::{ServerEvent, Topic};

/// Connection identifier, unique for the life of the process.
pub type ConnectionId = u64;

/// A serialized outbound event, shared between all recipients.
pub type Frame = Arc<str>;

/// Supplies the catch-up events a new subscriber receives before anything
/// published after its subscribe call.
pub trait SnapshotSource: Send + Sync + 'static {
    /// Events describing the current state of `topic`.
    fn snapshot(&self, topic: &Topic) -> Vec<ServerEvent>;
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Connection cap; `0` means unlimited.
    pub max_connections: usize,
    /// Topics whose frames are retained and replayed to new subscribers.
    pub retained: Vec<(Topic, usize)>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            retained: vec![(Topic::Chat, 100)],
        }
    }
}

/// Registry entry for one connection.
struct ClientEntry {
    topics: BTreeSet<Topic>,
    mailbox: mpsc::Sender<Frame>,
}

type Registry = Arc<RwLock<BTreeMap<ConnectionId, ClientEntry>>>;

enum HubCommand {
    Register {
        id: ConnectionId,
        mailbox: mpsc::Sender<Frame>,
    },
    Unregister {
        id: ConnectionId,
    },
    Subscribe {
        id: ConnectionId,
        topic: Topic,
    },
    Unsubscribe {
        id: ConnectionId,
        topic: Topic,
    },
    Publish {
        topic: Topic,
        frame: Frame,
    },
    SendTo {
        id: ConnectionId,
        frame: Frame,
    },
    Preload {
        topic: Topic,
        frames: Vec<Frame>,
    },
    Barrier {
        done: oneshot::Sender<()>,
    },
}

/// The hub constructor.
pub struct Hub;

impl Hub {
    /// Create a connected handle / dispatcher pair.
    ///
    /// The dispatcher must be driven with [`HubDispatcher::run`]; it stops
    /// once every handle has been dropped.
    pub fn new(config: HubConfig) -> (HubHandle, HubDispatcher) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry: Registry = Arc::new(RwLock::new(BTreeMap::new()));

        let retained = config
            .retained
            .iter()
            .map(|(topic, capacity)| (topic.clone(), HistoryRing::new(*capacity)))
            .collect();

        let handle = HubHandle {
            tx,
            registry: registry.clone(),
            next_id: Arc::new(AtomicU64::new(1)),
            max_connections: config.max_connections,
        };
        let dispatcher = HubDispatcher {
            rx,
            registry,
            retained,
        };
        (handle, dispatcher)
    }
}

/// Cheap, cloneable entry point to the hub.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
    registry: Registry,
    next_id: Arc<AtomicU64>,
    max_connections: usize,
}

impl HubHandle {
    fn send(&self, command: HubCommand) {
        if self.tx.send(command).is_err() {
            trace!("Hub dispatcher gone; command dropped");
        }
    }

    /// Allocate a fresh connection id.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Attach a connection's outbound mailbox.
    pub fn register(&self, id: ConnectionId, mailbox: mpsc::Sender<Frame>) {
        self.send(HubCommand::Register { id, mailbox });
    }

    /// Detach a connection. Drops the hub's mailbox sender.
    pub fn unregister(&self, id: ConnectionId) {
        self.send(HubCommand::Unregister { id });
    }

    /// Subscribe a connection. The topic's snapshot and retained frames are
    /// delivered before any later publish.
    pub fn subscribe(&self, id: ConnectionId, topic: Topic) {
        self.send(HubCommand::Subscribe { id, topic });
    }

    /// Unsubscribe a connection.
    pub fn unsubscribe(&self, id: ConnectionId, topic: Topic) {
        self.send(HubCommand::Unsubscribe { id, topic });
    }

    /// Broadcast an event to every subscriber of `topic`. Never blocks.
    pub fn publish(&self, topic: Topic, event: &ServerEvent) {
        if let Some(frame) = encode(event) {
            self.send(HubCommand::Publish { topic, frame });
        }
    }

    /// Deliver an event to one connection only.
    pub fn send_to(&self, id: ConnectionId, event: &ServerEvent) {
        if let Some(frame) = encode(event) {
            self.send(HubCommand::SendTo { id, frame });
        }
    }

    /// Seed a retained topic's backlog, oldest first.
    pub fn preload(&self, topic: Topic, events: &[ServerEvent]) {
        let frames = events.iter().filter_map(encode).collect();
        self.send(HubCommand::Preload { topic, frames });
    }

    /// Resolves once every command issued before it has been applied.
    pub async fn barrier(&self) {
        let (done, wait) = oneshot::channel();
        self.send(HubCommand::Barrier { done });
        let _ = wait.await;
    }

    /// Configured connection cap (`0` = unlimited).
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Registered connections.
    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Connections subscribed to `topic`.
    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        self.registry
            .read()
            .await
            .values()
            .filter(|entry| entry.topics.contains(topic))
            .count()
    }
}

fn encode(event: &ServerEvent) -> Option<Frame> {
    match event.to_json() {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            error!("Failed to serialize event: {}", e);
            None
        }
    }
}

fn deliver(id: ConnectionId, mailbox: &mpsc::Sender<Frame>, frame: &Frame) {
    match mailbox.try_send(frame.clone()) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            trace!("Mailbox full for connection {}; frame dropped", id);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            trace!("Mailbox closed for connection {}", id);
        }
    }
}

/// Single serialization point for hub mutations.
pub struct HubDispatcher {
    rx: mpsc::UnboundedReceiver<HubCommand>,
    registry: Registry,
    retained: HashMap<Topic, HistoryRing<Frame>>,
}

impl HubDispatcher {
    /// Apply commands until every handle is dropped.
    pub async fn run<S: SnapshotSource + ?Sized>(mut self, snapshots: Arc<S>) {
        while let Some(command) = self.rx.recv().await {
            self.apply(command, snapshots.as_ref()).await;
        }
        debug!("Hub dispatcher stopped");
    }

    async fn apply<S: SnapshotSource + ?Sized>(&mut self, command: HubCommand, snapshots: &S) {
        match command {
            HubCommand::Register { id, mailbox } => {
                let mut registry = self.registry.write().await;
                registry.insert(
                    id,
                    ClientEntry {
                        topics: BTreeSet::new(),
                        mailbox,
                    },
                );
                debug!("Connection {} registered ({} total)", id, registry.len());
            }
            HubCommand::Unregister { id } => {
                let mut registry = self.registry.write().await;
                if registry.remove(&id).is_some() {
                    debug!("Connection {} unregistered ({} total)", id, registry.len());
                }
            }
            HubCommand::Subscribe { id, topic } => {
                let mailbox = {
                    let mut registry = self.registry.write().await;
                    match registry.get_mut(&id) {
                        Some(entry) => {
                            entry.topics.insert(topic.clone());
                            entry.mailbox.clone()
                        }
                        None => return,
                    }
                };

                let mut sent = 0;
                for event in snapshots.snapshot(&topic) {
                    if let Some(frame) = encode(&event) {
                        deliver(id, &mailbox, &frame);
                        sent += 1;
                    }
                }
                if let Some(ring) = self.retained.get(&topic) {
                    for frame in ring.iter() {
                        deliver(id, &mailbox, frame);
                        sent += 1;
                    }
                }
                debug!("Connection {} subscribed to {} ({} catch-up frames)", id, topic, sent);
            }
            HubCommand::Unsubscribe { id, topic } => {
                let mut registry = self.registry.write().await;
                if let Some(entry) = registry.get_mut(&id) {
                    entry.topics.remove(&topic);
                    debug!("Connection {} unsubscribed from {}", id, topic);
                }
            }
            HubCommand::Publish { topic, frame } => {
                if let Some(ring) = self.retained.get_mut(&topic) {
                    ring.push(frame.clone());
                }
                let registry = self.registry.read().await;
                for (id, entry) in registry.iter() {
                    if entry.topics.contains(&topic) {
                        deliver(*id, &entry.mailbox, &frame);
                    }
                }
            }
            HubCommand::SendTo { id, frame } => {
                let registry = self.registry.read().await;
                if let Some(entry) = registry.get(&id) {
                    deliver(id, &entry.mailbox, &frame);
                }
            }
            HubCommand::Preload { topic, frames } => {
                match self.retained.get_mut(&topic) {
                    Some(ring) => ring.extend(frames),
                    None => debug!("Preload ignored for non-retained topic {}", topic),
                }
            }
            HubCommand::Barrier { done } => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::network::protocol::ChatEntry;

    struct NoSnapshots;

    impl SnapshotSource for NoSnapshots {
        fn snapshot(&self, _topic: &Topic) -> Vec<ServerEvent> {
            Vec::new()
        }
    }

    struct FixedSnapshot;

    impl SnapshotSource for FixedSnapshot {
        fn snapshot(&self, topic: &Topic) -> Vec<ServerEvent> {
            match topic {
                Topic::Crash => vec![ServerEvent::active_bettors(vec![])],
                _ => Vec::new(),
            }
        }
    }

    fn chat(message: &str) -> ServerEvent {
        ServerEvent::ChatMessage(ChatEntry {
            player_address: "0xA".into(),
            message: message.into(),
            timestamp: Utc::now(),
        })
    }

    fn message_of(frame: &Frame) -> String {
        let value: serde_json::Value = serde_json::from_str(frame).unwrap();
        value["message"].as_str().unwrap_or_default().to_string()
    }

    fn start<S: SnapshotSource>(config: HubConfig, source: S) -> HubHandle {
        let (handle, dispatcher) = Hub::new(config);
        tokio::spawn(dispatcher.run(Arc::new(source)));
        handle
    }

    #[tokio::test]
    async fn test_chat_backlog_before_live_messages() {
        let hub = start(HubConfig::default(), NoSnapshots);
        hub.preload(Topic::Chat, &[chat("one"), chat("two"), chat("three")]);

        let (tx, mut rx) = mpsc::channel(16);
        let id = hub.next_connection_id();
        hub.register(id, tx);
        hub.subscribe(id, Topic::Chat);
        hub.publish(Topic::Chat, &chat("four"));

        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(message_of(&rx.recv().await.unwrap()));
        }
        assert_eq!(got, vec!["one", "two", "three", "four"]);
    }

    #[tokio::test]
    async fn test_snapshot_precedes_publish() {
        let hub = start(HubConfig::default(), FixedSnapshot);
        let (tx, mut rx) = mpsc::channel(16);
        hub.register(7, tx);
        hub.subscribe(7, Topic::Crash);
        hub.publish(Topic::Crash, &ServerEvent::Pong { server_time: 1 });

        let first = rx.recv().await.unwrap();
        assert!(first.contains("active_bettors"));
        let second = rx.recv().await.unwrap();
        assert!(second.contains("pong"));
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let hub = start(HubConfig::default(), NoSnapshots);
        let (tx, mut rx) = mpsc::channel(16);
        hub.register(1, tx);
        hub.subscribe(1, Topic::room("a"));
        hub.publish(Topic::room("b"), &ServerEvent::Pong { server_time: 1 });
        hub.publish(Topic::Rooms, &ServerEvent::Pong { server_time: 2 });
        hub.publish(Topic::room("a"), &ServerEvent::Pong { server_time: 3 });

        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("\"serverTime\":3"));
        hub.barrier().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_mailbox_drops_but_preserves_order() {
        let hub = start(HubConfig::default(), NoSnapshots);
        let (slow_tx, mut slow_rx) = mpsc::channel(4);
        let (fast_tx, mut fast_rx) = mpsc::channel(64);
        hub.register(1, slow_tx);
        hub.register(2, fast_tx);
        hub.subscribe(1, Topic::Crash);
        hub.subscribe(2, Topic::Crash);

        for i in 0..20 {
            hub.publish(Topic::Crash, &ServerEvent::Pong { server_time: i });
        }
        hub.barrier().await;

        let mut slow = Vec::new();
        while let Ok(frame) = slow_rx.try_recv() {
            slow.push(frame);
        }
        let mut fast = Vec::new();
        while let Ok(frame) = fast_rx.try_recv() {
            fast.push(frame);
        }

        assert_eq!(fast.len(), 20);
        assert_eq!(slow.len(), 4);
        // Slow subscriber sees an ordered subsequence of the publishes.
        let mut cursor = fast.iter();
        for frame in &slow {
            assert!(cursor.any(|f| f == frame));
        }
    }

    #[tokio::test]
    async fn test_unregister_closes_mailbox() {
        let hub = start(HubConfig::default(), NoSnapshots);
        let (tx, mut rx) = mpsc::channel(4);
        hub.register(3, tx);
        hub.barrier().await;
        assert_eq!(hub.connection_count().await, 1);

        hub.unregister(3);
        assert!(rx.recv().await.is_none());
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_to_and_counts() {
        let hub = start(
            HubConfig {
                max_connections: 1,
                ..HubConfig::default()
            },
            NoSnapshots,
        );
        assert_eq!(hub.max_connections(), 1);
        assert_eq!(hub.connection_count().await, 0);

        let (tx, mut rx) = mpsc::channel(4);
        hub.register(5, tx);
        hub.subscribe(5, Topic::Chat);
        hub.send_to(5, &ServerEvent::Pong { server_time: 9 });
        hub.barrier().await;

        assert_eq!(hub.connection_count().await, 1);
        assert_eq!(hub.subscriber_count(&Topic::Chat).await, 1);
        assert_eq!(hub.subscriber_count(&Topic::Crash).await, 0);
        assert!(rx.recv().await.unwrap().contains("pong"));

        hub.unsubscribe(5, Topic::Chat);
        hub.barrier().await;
        assert_eq!(hub.subscriber_count(&Topic::Chat).await, 0);
    }

    #[tokio::test]
    async fn test_retained_ring_is_bounded() {
        let hub = start(
            HubConfig {
                max_connections: 0,
                retained: vec![(Topic::Chat, 2)],
            },
            NoSnapshots,
        );
        for word in ["a", "b", "c"] {
            hub.publish(Topic::Chat, &chat(word));
        }

        let (tx, mut rx) = mpsc::channel(8);
        hub.register(1, tx);
        hub.subscribe(1, Topic::Chat);
        hub.barrier().await;

        assert_eq!(message_of(&rx.recv().await.unwrap()), "b");
        assert_eq!(message_of(&rx.recv().await.unwrap()), "c");
        assert!(rx.try_recv().is_err());
    }
}
