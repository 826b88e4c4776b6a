use std::sync::Arc;

use alert_common::alert::StreamKey;
use tracing::{debug, warn};

use crate::registry::{StreamRegistry, Subscriber};

const METRIC_MESSAGES_DELIVERED: &str = "alert_notifier_messages_delivered_total";
const METRIC_SUBSCRIBERS_PRUNED: &str = "alert_notifier_subscribers_pruned_total";

/// Delivers messages to the subscribers of a stream, pruning any that cannot take them.
///
/// Delivery never waits on a subscriber and is never retried: a subscriber whose connection is
/// closed or whose buffer is full is unsubscribed once the delivery pass is over, which in turn
/// closes its connection.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<StreamRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<StreamRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver `message` to every subscriber of `stream` registered when the call starts.
    /// Returns how many subscribers it was handed to.
    pub fn send_to_stream(&self, stream: &StreamKey, message: &str) -> usize {
        let connections = self.registry.snapshot(stream);
        if connections.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut failed: Vec<Subscriber> = Vec::new();

        for connection in &connections {
            match connection.deliver(message) {
                Ok(()) => delivered += 1,
                Err(error) => {
                    warn!(
                        stream = %stream,
                        subscriber = connection.subscriber().id(),
                        error = %error,
                        "failed to deliver message, pruning subscriber"
                    );
                    failed.push(connection.subscriber().clone());
                }
            }
        }

        for subscriber in &failed {
            if self.registry.unsubscribe(subscriber) {
                metrics::counter!(METRIC_SUBSCRIBERS_PRUNED).increment(1);
            }
        }

        let labels = [("stream", stream.to_string())];
        metrics::counter!(METRIC_MESSAGES_DELIVERED, &labels).increment(delivered as u64);
        debug!(stream = %stream, delivered, pruned = failed.len(), "message dispatched");

        delivered
    }

    /// Deliver `message` to every stream active when the call starts. Streams created while
    /// the broadcast is running are not included.
    pub fn send_to_all(&self, message: &str) -> usize {
        let streams = self.registry.list_active_streams();

        streams
            .iter()
            .map(|stream| self.send_to_stream(stream, message))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<StreamRegistry>, Dispatcher) {
        let registry = StreamRegistry::new();
        let dispatcher = Dispatcher::new(registry.clone());
        (registry, dispatcher)
    }

    #[tokio::test]
    async fn test_send_to_stream_reaches_only_that_stream() {
        let (registry, dispatcher) = setup();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let (tx3, mut rx3) = mpsc::channel(8);
        registry.subscribe(tx1, StreamKey::from("cam7"));
        registry.subscribe(tx2, StreamKey::from("cam7"));
        registry.subscribe(tx3, StreamKey::from("cam8"));

        let delivered = dispatcher.send_to_stream(&StreamKey::from("cam7"), "alert");

        assert_eq!(delivered, 2);
        assert_eq!(rx1.recv().await.as_deref(), Some("alert"));
        assert_eq!(rx2.recv().await.as_deref(), Some("alert"));
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn test_send_to_unknown_stream_is_a_noop() {
        let (registry, dispatcher) = setup();

        assert_eq!(dispatcher.send_to_stream(&StreamKey::from("cam7"), "alert"), 0);
        assert!(registry.list_active_streams().is_empty());
    }

    #[tokio::test]
    async fn test_failed_subscribers_are_pruned() {
        let (registry, dispatcher) = setup();
        let cam7 = StreamKey::from("cam7");
        let (alive_tx, mut alive_rx) = mpsc::channel(8);
        let (dead_tx, dead_rx) = mpsc::channel(8);
        registry.subscribe(alive_tx, cam7.clone());
        registry.subscribe(dead_tx, cam7.clone());
        drop(dead_rx);

        assert_eq!(dispatcher.send_to_stream(&cam7, "first"), 1);
        assert_eq!(registry.count_subscribers(&cam7), 1);
        assert_eq!(alive_rx.recv().await.as_deref(), Some("first"));

        assert_eq!(dispatcher.send_to_stream(&cam7, "second"), 1);
        assert_eq!(alive_rx.recv().await.as_deref(), Some("second"));
    }

    #[test]
    fn test_last_failed_subscriber_removes_stream() {
        let (registry, dispatcher) = setup();
        let (tx, rx) = mpsc::channel(8);
        registry.subscribe(tx, StreamKey::from("cam7"));
        drop(rx);

        assert_eq!(dispatcher.send_to_stream(&StreamKey::from("cam7"), "alert"), 0);
        assert!(registry.list_active_streams().is_empty());
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_pruned_when_buffer_is_full() {
        let (registry, dispatcher) = setup();
        let (tx, mut rx) = mpsc::channel(1);
        registry.subscribe(tx, StreamKey::general());

        assert_eq!(dispatcher.send_to_stream(&StreamKey::general(), "one"), 1);
        assert_eq!(dispatcher.send_to_stream(&StreamKey::general(), "two"), 0);
        assert_eq!(registry.count_subscribers(&StreamKey::general()), 0);

        // Whatever was queued before pruning is still drained, then the channel ends.
        assert_eq!(rx.recv().await.as_deref(), Some("one"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_to_all_reaches_every_stream() {
        let (registry, dispatcher) = setup();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let (tx3, rx3) = mpsc::channel(8);
        registry.subscribe(tx1, StreamKey::general());
        registry.subscribe(tx2, StreamKey::from("cam7"));
        registry.subscribe(tx3, StreamKey::from("cam8"));
        drop(rx3);

        assert_eq!(dispatcher.send_to_all("maintenance"), 2);
        assert_eq!(rx1.recv().await.as_deref(), Some("maintenance"));
        assert_eq!(rx2.recv().await.as_deref(), Some("maintenance"));
        assert_eq!(registry.list_active_streams().len(), 2);
    }
}
