//! Tracks live subscriber connections grouped by the stream they asked for.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use alert_common::alert::StreamKey;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

const METRIC_ACTIVE_SUBSCRIBERS: &str = "alert_notifier_active_subscribers";

/// The registry's half of a subscriber connection. The connection task owns the receiver and
/// writes whatever arrives on it to the socket.
pub type ConnectionSender = mpsc::Sender<String>;

/// Why a message could not be handed to a subscriber.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("subscriber connection is closed")]
    Closed,
    #[error("subscriber is not keeping up, outbound buffer is full")]
    Full,
}

/// Handle identifying one subscribed connection. Returned by `subscribe` and used to
/// `unsubscribe`. Its stream key is fixed for the lifetime of the subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscriber {
    id: u64,
    stream: StreamKey,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream_key(&self) -> &StreamKey {
        &self.stream
    }
}

/// A registered connection, as handed out to the dispatcher in snapshots.
#[derive(Clone)]
pub(crate) struct Connection {
    subscriber: Subscriber,
    sender: ConnectionSender,
}

impl Connection {
    pub(crate) fn subscriber(&self) -> &Subscriber {
        &self.subscriber
    }

    /// Queue a message for the connection without waiting.
    pub(crate) fn deliver(&self, message: &str) -> Result<(), DeliveryError> {
        self.sender
            .try_send(message.to_owned())
            .map_err(|error| match error {
                TrySendError::Closed(_) => DeliveryError::Closed,
                TrySendError::Full(_) => DeliveryError::Full,
            })
    }
}

/// Live subscribers per stream key.
///
/// A key is present only while it has at least one subscriber: the entry is removed as soon as
/// its last subscriber leaves. All operations take a single lock over the whole map.
pub struct StreamRegistry {
    streams: RwLock<HashMap<StreamKey, Vec<Connection>>>,
    next_id: AtomicU64,
}

impl StreamRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a connection under `stream`, creating the stream's entry if needed.
    pub fn subscribe(&self, connection: ConnectionSender, stream: StreamKey) -> Subscriber {
        let subscriber = Subscriber {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            stream,
        };

        let mut streams = self.streams.write();
        streams
            .entry(subscriber.stream.clone())
            .or_default()
            .push(Connection {
                subscriber: subscriber.clone(),
                sender: connection,
            });
        report_active_subscribers(&streams);

        debug!(
            stream = %subscriber.stream,
            subscriber = subscriber.id,
            "subscriber registered"
        );

        subscriber
    }

    /// Remove a subscriber, dropping its stream's entry if it was the last one.
    /// Returns whether anything was removed: unsubscribing twice is a no-op.
    pub fn unsubscribe(&self, subscriber: &Subscriber) -> bool {
        let mut streams = self.streams.write();

        let Some(connections) = streams.get_mut(&subscriber.stream) else {
            return false;
        };

        let before = connections.len();
        connections.retain(|connection| connection.subscriber.id != subscriber.id);
        let removed = connections.len() < before;

        if connections.is_empty() {
            streams.remove(&subscriber.stream);
        }

        if removed {
            report_active_subscribers(&streams);
            debug!(
                stream = %subscriber.stream,
                subscriber = subscriber.id,
                "subscriber removed"
            );
        }

        removed
    }

    /// Every stream key with at least one subscriber, as of now.
    pub fn list_active_streams(&self) -> HashSet<StreamKey> {
        self.streams.read().keys().cloned().collect()
    }

    pub fn count_subscribers(&self, stream: &StreamKey) -> usize {
        self.streams
            .read()
            .get(stream)
            .map(|connections| connections.len())
            .unwrap_or(0)
    }

    /// The connections registered under `stream` at call time.
    pub(crate) fn snapshot(&self, stream: &StreamKey) -> Vec<Connection> {
        self.streams
            .read()
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

fn report_active_subscribers(streams: &HashMap<StreamKey, Vec<Connection>>) {
    let total: usize = streams.values().map(Vec::len).sum();
    metrics::gauge!(METRIC_ACTIVE_SUBSCRIBERS).set(total as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (ConnectionSender, mpsc::Receiver<String>) {
        mpsc::channel(8)
    }

    #[test]
    fn test_subscribe_creates_stream_entry() {
        let registry = StreamRegistry::new();
        let (tx, _rx) = connection();

        let subscriber = registry.subscribe(tx, StreamKey::from("cam7"));

        assert_eq!(subscriber.stream_key().as_str(), "cam7");
        assert_eq!(registry.count_subscribers(&StreamKey::from("cam7")), 1);
        assert!(registry
            .list_active_streams()
            .contains(&StreamKey::from("cam7")));
    }

    #[test]
    fn test_subscribers_get_distinct_ids() {
        let registry = StreamRegistry::new();
        let (tx1, _rx1) = connection();
        let (tx2, _rx2) = connection();

        let first = registry.subscribe(tx1, StreamKey::general());
        let second = registry.subscribe(tx2, StreamKey::general());

        assert_ne!(first.id(), second.id());
        assert_eq!(registry.count_subscribers(&StreamKey::general()), 2);
        assert_eq!(registry.list_active_streams().len(), 1);
    }

    #[test]
    fn test_last_unsubscribe_removes_stream() {
        let registry = StreamRegistry::new();
        let (tx1, _rx1) = connection();
        let (tx2, _rx2) = connection();
        let cam7 = StreamKey::from("cam7");

        let first = registry.subscribe(tx1, cam7.clone());
        let second = registry.subscribe(tx2, cam7.clone());

        assert!(registry.unsubscribe(&first));
        assert_eq!(registry.count_subscribers(&cam7), 1);
        assert!(registry.list_active_streams().contains(&cam7));

        assert!(registry.unsubscribe(&second));
        assert_eq!(registry.count_subscribers(&cam7), 0);
        assert!(registry.list_active_streams().is_empty());
    }

    #[test]
    fn test_unsubscribe_twice_is_a_noop() {
        let registry = StreamRegistry::new();
        let (tx1, _rx1) = connection();
        let (tx2, _rx2) = connection();
        let cam7 = StreamKey::from("cam7");

        let leaving = registry.subscribe(tx1, cam7.clone());
        let _staying = registry.subscribe(tx2, cam7.clone());

        assert!(registry.unsubscribe(&leaving));
        assert!(!registry.unsubscribe(&leaving));
        assert_eq!(registry.count_subscribers(&cam7), 1);
        assert_eq!(registry.list_active_streams(), HashSet::from([cam7]));
    }

    #[test]
    fn test_unknown_stream_has_no_subscribers() {
        let registry = StreamRegistry::new();

        assert_eq!(registry.count_subscribers(&StreamKey::from("nope")), 0);
        assert!(registry.snapshot(&StreamKey::from("nope")).is_empty());
        assert!(registry.list_active_streams().is_empty());
    }

    #[tokio::test]
    async fn test_deliver_reports_closed_and_full() {
        let registry = StreamRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        registry.subscribe(tx, StreamKey::general());

        let connections = registry.snapshot(&StreamKey::general());
        let connection = &connections[0];

        assert_eq!(connection.deliver("one"), Ok(()));
        assert_eq!(connection.deliver("two"), Err(DeliveryError::Full));
        assert_eq!(rx.recv().await.as_deref(), Some("one"));

        drop(rx);
        assert_eq!(connection.deliver("three"), Err(DeliveryError::Closed));
    }
}
