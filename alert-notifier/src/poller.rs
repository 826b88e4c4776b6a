use std::sync::Arc;
use std::time;

use alert_common::alert::{AlertMessage, NotificationRecord};
use alert_common::health::HealthHandle;
use alert_common::store::{NotificationSession, NotificationStore, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;

const METRIC_NOTIFICATIONS_PROCESSED: &str = "alert_notifier_notifications_processed_total";
const METRIC_NOTIFICATIONS_MALFORMED: &str = "alert_notifier_notifications_malformed_total";
const METRIC_POLL_ERRORS: &str = "alert_notifier_poll_errors_total";

/// What one poll cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    /// Unprocessed notifications read from storage.
    pub fetched: usize,
    /// Subscriber deliveries across the whole batch.
    pub delivered: usize,
    /// Notifications marked processed in the session.
    pub marked: usize,
    /// Rows that could not be turned into an alert message. They are still marked processed.
    pub malformed: usize,
    /// Whether the session's marks were committed.
    pub committed: bool,
}

/// How a poll cycle ended, which decides how long to sleep before the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// A session was opened and the batch went through, committed or not.
    Batch(BatchSummary),
    /// Reading unprocessed notifications failed. They are left for the next cycle.
    QueryFailed,
    /// No session could be opened.
    StorageUnavailable,
}

/// A loop that polls the notification queue and hands each new alert to the `Dispatcher`.
///
/// Every cycle opens one storage session, reads all unprocessed notifications, dispatches each
/// one to its stream, marks it processed and commits once for the whole batch. Delivery and
/// marking are not atomic: a crash, failed mark or failed commit after dispatch delivers the same
/// alerts again on a later cycle. Subscribers can de-duplicate on `alert_id`.
pub struct QueuePoller {
    /// The storage holding the notification queue.
    store: Arc<dyn NotificationStore>,
    /// Delivers alert messages to subscribers.
    dispatcher: Dispatcher,
    /// The interval between poll cycles.
    poll_interval: time::Duration,
    /// The interval before retrying when storage is unreachable.
    connection_backoff: time::Duration,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

impl QueuePoller {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        dispatcher: Dispatcher,
        poll_interval: time::Duration,
        connection_backoff: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            store,
            dispatcher,
            poll_interval,
            connection_backoff,
            liveness,
        }
    }

    /// Run poll cycles until `shutdown` is cancelled. Errors never end the loop.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "starting notification queue poller"
        );

        loop {
            self.liveness.report_healthy();

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.poll_once() => outcome,
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.delay_after(&outcome)) => {}
            }
        }

        info!("notification queue poller stopped");
    }

    /// How long to wait before the next cycle.
    pub fn delay_after(&self, outcome: &PollOutcome) -> time::Duration {
        match outcome {
            PollOutcome::StorageUnavailable => self.connection_backoff,
            PollOutcome::Batch(_) | PollOutcome::QueryFailed => self.poll_interval,
        }
    }

    /// Run a single poll cycle. The session it opens is committed, rolled back, or dropped
    /// (and so rolled back) before it returns.
    pub async fn poll_once(&self) -> PollOutcome {
        let mut session = match self.store.begin().await {
            Ok(session) => session,
            Err(error) => {
                error!(error = %error, "failed to open storage session");
                metrics::counter!(METRIC_POLL_ERRORS, &[("kind", error.kind())]).increment(1);
                return PollOutcome::StorageUnavailable;
            }
        };

        let records = match session.fetch_unprocessed().await {
            Ok(records) => records,
            Err(error) => {
                error!(error = %error, "failed to fetch unprocessed notifications");
                metrics::counter!(METRIC_POLL_ERRORS, &[("kind", error.kind())]).increment(1);
                if let Err(error) = session.rollback().await {
                    error!(error = %error, "failed to roll back storage session");
                }
                return PollOutcome::QueryFailed;
            }
        };

        let mut summary = BatchSummary {
            fetched: records.len(),
            ..Default::default()
        };

        for (index, record) in records.iter().enumerate() {
            if let Err(error) = self.process_record(session.as_mut(), record, &mut summary).await {
                error!(
                    notification_id = record.notification_id,
                    error = %error,
                    skipped = records.len() - index - 1,
                    "failed to mark notification processed, rolling back the batch"
                );
                metrics::counter!(METRIC_POLL_ERRORS, &[("kind", error.kind())]).increment(1);
                if let Err(error) = session.rollback().await {
                    error!(error = %error, "failed to roll back storage session");
                }
                return PollOutcome::Batch(summary);
            }
        }

        match session.commit().await {
            Ok(()) => {
                summary.committed = true;
                metrics::counter!(METRIC_NOTIFICATIONS_PROCESSED).increment(summary.marked as u64);
            }
            Err(error) => {
                error!(
                    error = %error,
                    marked = summary.marked,
                    "failed to commit processed notifications, they will be delivered again"
                );
                metrics::counter!(METRIC_POLL_ERRORS, &[("kind", error.kind())]).increment(1);
            }
        }

        if summary.fetched > 0 {
            info!(
                fetched = summary.fetched,
                delivered = summary.delivered,
                marked = summary.marked,
                malformed = summary.malformed,
                committed = summary.committed,
                "processed notification batch"
            );
        }

        PollOutcome::Batch(summary)
    }

    /// Dispatch one notification and mark it processed. A row that cannot be turned into an alert
    /// message is still marked. Only a storage failure while marking is returned.
    async fn process_record(
        &self,
        session: &mut dyn NotificationSession,
        record: &NotificationRecord,
        summary: &mut BatchSummary,
    ) -> Result<(), StoreError> {
        match build_payload(record) {
            Some((alert, payload)) => {
                let delivered = self.dispatcher.send_to_stream(alert.stream_key(), &payload);
                debug!(
                    alert_id = alert.alert_id,
                    stream = %alert.stream_key(),
                    delivered,
                    "dispatched alert"
                );
                summary.delivered += delivered;
            }
            None => {
                summary.malformed += 1;
                metrics::counter!(METRIC_NOTIFICATIONS_MALFORMED).increment(1);
            }
        }

        session.mark_processed(record.notification_id).await?;
        summary.marked += 1;

        Ok(())
    }
}

/// Build the wire payload for a notification, or `None` if the row cannot be represented.
fn build_payload(record: &NotificationRecord) -> Option<(AlertMessage, String)> {
    let alert = match AlertMessage::try_from(record) {
        Ok(alert) => alert,
        Err(error) => {
            warn!(
                notification_id = record.notification_id,
                alert_id = record.alert_id,
                error = %error,
                "skipping malformed notification"
            );
            return None;
        }
    };

    match alert.to_json() {
        Ok(payload) => Some((alert, payload)),
        Err(error) => {
            warn!(
                notification_id = record.notification_id,
                alert_id = record.alert_id,
                error = %error,
                "failed to serialize alert message"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alert_common::alert::{NewAlert, StreamKey};
    use alert_common::health::HealthRegistry;
    use alert_common::store::MemoryStore;
    use tokio::sync::mpsc;

    use crate::registry::StreamRegistry;

    fn poller(store: &MemoryStore, registry: &Arc<StreamRegistry>) -> QueuePoller {
        let liveness = HealthRegistry::new("liveness")
            .register("poller".to_string(), ::time::Duration::seconds(30));

        QueuePoller::new(
            Arc::new(store.clone()),
            Dispatcher::new(registry.clone()),
            time::Duration::from_millis(2000),
            time::Duration::from_millis(5000),
            liveness,
        )
    }

    fn alert(person_id: i64, video_id: Option<&str>) -> NewAlert {
        NewAlert {
            person_id,
            camera_location: "CAM_002_Lobby".to_owned(),
            video_id: video_id.map(str::to_owned),
            confidence_score: 77.5,
        }
    }

    #[tokio::test]
    async fn test_empty_queue_commits_empty_batch() {
        let store = MemoryStore::new();
        let registry = StreamRegistry::new();

        let outcome = poller(&store, &registry).poll_once().await;

        assert_eq!(
            outcome,
            PollOutcome::Batch(BatchSummary {
                committed: true,
                ..Default::default()
            })
        );
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_alert_without_video_id_goes_to_general() {
        let store = MemoryStore::new();
        let person_id = store.add_person("Jane Suspect", "MEDIUM");
        let alert_id = store.add_alert(alert(person_id, None));
        let registry = StreamRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        registry.subscribe(tx, StreamKey::general());

        poller(&store, &registry).poll_once().await;

        let message: AlertMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(message.alert_id, alert_id);
        assert!(message.video_id.is_general());
        assert!(store.is_processed(alert_id));
    }

    #[tokio::test]
    async fn test_malformed_row_is_marked_without_dispatch() {
        let store = MemoryStore::new();
        let person_id = store.add_person("Bob Criminal", "APOCALYPTIC");
        let alert_id = store.add_alert(alert(person_id, None));
        let registry = StreamRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        registry.subscribe(tx, StreamKey::general());

        let outcome = poller(&store, &registry).poll_once().await;

        assert_eq!(
            outcome,
            PollOutcome::Batch(BatchSummary {
                fetched: 1,
                delivered: 0,
                marked: 1,
                malformed: 1,
                committed: true,
            })
        );
        assert!(rx.try_recv().is_err());
        assert!(store.is_processed(alert_id));
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_rows_for_next_cycle() {
        let store = MemoryStore::new();
        let person_id = store.add_person("Bob Criminal", "HIGH");
        let alert_id = store.add_alert(alert(person_id, Some("cam7")));
        store.fail_next_fetches(1);
        let registry = StreamRegistry::new();
        let poller = poller(&store, &registry);

        let outcome = poller.poll_once().await;
        assert_eq!(outcome, PollOutcome::QueryFailed);
        assert_eq!(poller.delay_after(&outcome), time::Duration::from_millis(2000));
        assert!(!store.is_processed(alert_id));
        assert_eq!(store.open_sessions(), 0);

        poller.poll_once().await;
        assert!(store.is_processed(alert_id));
    }

    #[tokio::test]
    async fn test_failed_mark_skips_rest_of_batch() {
        let store = MemoryStore::new();
        let person_id = store.add_person("Bob Criminal", "HIGH");
        let first = store.add_alert(alert(person_id, Some("cam7")));
        let second = store.add_alert(alert(person_id, Some("cam7")));
        store.fail_next_marks(1);
        let registry = StreamRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        registry.subscribe(tx, StreamKey::from("cam7"));
        let poller = poller(&store, &registry);

        let outcome = poller.poll_once().await;

        assert_eq!(
            outcome,
            PollOutcome::Batch(BatchSummary {
                fetched: 2,
                delivered: 1,
                marked: 0,
                malformed: 0,
                committed: false,
            })
        );
        assert!(!store.is_processed(first));
        assert!(!store.is_processed(second));
        assert_eq!(store.open_sessions(), 0);
        let delivered: AlertMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(delivered.alert_id, first);
        assert!(rx.try_recv().is_err());

        // Both rows are picked up by the next cycle; the first one is delivered again.
        poller.poll_once().await;
        assert!(store.is_processed(first));
        assert!(store.is_processed(second));
        assert_eq!(store.times_marked(first), 1);
        let redelivered: AlertMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(redelivered.alert_id, first);
        let next: AlertMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(next.alert_id, second);
    }

    #[tokio::test]
    async fn test_failed_commit_redelivers_next_cycle() {
        let store = MemoryStore::new();
        let person_id = store.add_person("John Dangerous", "HIGH");
        let alert_id = store.add_alert(alert(person_id, Some("cam7")));
        store.fail_next_commits(1);
        let registry = StreamRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        registry.subscribe(tx, StreamKey::from("cam7"));
        let poller = poller(&store, &registry);

        let PollOutcome::Batch(summary) = poller.poll_once().await else {
            panic!("expected a batch");
        };
        assert!(!summary.committed);
        assert!(!store.is_processed(alert_id));

        poller.poll_once().await;
        assert!(store.is_processed(alert_id));
        assert_eq!(store.times_marked(alert_id), 1);

        // At-least-once: the alert reached the subscriber once per cycle that saw it.
        let first: AlertMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let second: AlertMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.alert_id, alert_id);
        assert_eq!(second.alert_id, alert_id);
    }

    #[tokio::test]
    async fn test_unavailable_storage_backs_off() {
        let store = MemoryStore::new();
        store.fail_next_begins(1);
        let registry = StreamRegistry::new();
        let poller = poller(&store, &registry);

        let outcome = poller.poll_once().await;

        assert_eq!(outcome, PollOutcome::StorageUnavailable);
        assert_eq!(poller.delay_after(&outcome), time::Duration::from_millis(5000));
        assert_eq!(
            poller.delay_after(&PollOutcome::Batch(BatchSummary::default())),
            time::Duration::from_millis(2000)
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = MemoryStore::new();
        let registry = StreamRegistry::new();
        let poller = poller(&store, &registry);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { poller.run(shutdown).await }
        });

        tokio::time::sleep(time::Duration::from_millis(50)).await;
        shutdown.cancel();

        tokio::time::timeout(time::Duration::from_secs(1), handle)
            .await
            .expect("poller did not stop after cancellation")
            .expect("poller task panicked");
        assert_eq!(store.begin_attempts(), 1);
        assert_eq!(store.open_sessions(), 0);
    }
}
