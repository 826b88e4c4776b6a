use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
    AlertStore, NotificationSession, NotificationStore, StoreError, StoreResult,
    SAMPLE_BLACKLISTED_PERSONS,
};
use crate::alert::{AlertSummary, BlacklistedPerson, NewAlert, NotificationRecord};

#[derive(Debug, Clone)]
struct StoredAlert {
    id: i64,
    person_id: i64,
    camera_location: String,
    video_id: Option<String>,
    confidence_score: f64,
    detection_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct QueuedNotification {
    id: i64,
    alert_id: i64,
    message: String,
    processed: bool,
    times_marked: usize,
}

#[derive(Debug, Default)]
struct Tables {
    persons: Vec<BlacklistedPerson>,
    alerts: Vec<StoredAlert>,
    queue: Vec<QueuedNotification>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn unprocessed(&self) -> Vec<NotificationRecord> {
        self.queue
            .iter()
            .filter(|notification| !notification.processed)
            .filter_map(|notification| {
                let alert = self.alerts.iter().find(|a| a.id == notification.alert_id)?;
                let person = self.persons.iter().find(|p| p.id == alert.person_id)?;

                Some(NotificationRecord {
                    notification_id: notification.id,
                    alert_id: alert.id,
                    person_id: person.id,
                    camera_location: alert.camera_location.clone(),
                    video_id: alert.video_id.clone(),
                    confidence_score: alert.confidence_score,
                    detection_time: alert.detection_time,
                    threat_level: person.threat_level.clone(),
                    person_name: person.name.clone(),
                    message: notification.message.clone(),
                    processed: notification.processed,
                })
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct FailureBudget {
    begins: AtomicUsize,
    pings: AtomicUsize,
    fetches: AtomicUsize,
    marks: AtomicUsize,
    commits: AtomicUsize,
}

/// Take one failure from a budget, returning whether the caller should fail.
fn take(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// An in-process stand-in for the alert database, used to run the notifier without PostgreSQL.
///
/// Inserting an alert enqueues its notification the way the database trigger does. Failures can
/// be injected per operation to exercise the notifier's error paths.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    failures: Arc<FailureBudget>,
    begins: Arc<AtomicUsize>,
    open_sessions: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_person(&self, name: &str, threat_level: &str) -> i64 {
        let mut tables = self.tables.lock();
        let id = tables.next_id();
        tables.persons.push(BlacklistedPerson {
            id,
            name: name.to_owned(),
            threat_level: threat_level.to_owned(),
        });
        id
    }

    /// Record an alert detected now and enqueue its notification. Returns the alert id.
    pub fn add_alert(&self, alert: NewAlert) -> i64 {
        self.add_alert_at(alert, Utc::now())
    }

    pub fn add_alert_at(&self, alert: NewAlert, detection_time: DateTime<Utc>) -> i64 {
        let mut tables = self.tables.lock();
        let alert_id = tables.next_id();
        let person_name = tables
            .persons
            .iter()
            .find(|p| p.id == alert.person_id)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        let message = format!(
            "ALERT: {} detected at {}",
            person_name, alert.camera_location
        );

        tables.alerts.push(StoredAlert {
            id: alert_id,
            person_id: alert.person_id,
            camera_location: alert.camera_location,
            video_id: alert.video_id,
            confidence_score: alert.confidence_score,
            detection_time,
        });

        let notification_id = tables.next_id();
        tables.queue.push(QueuedNotification {
            id: notification_id,
            alert_id,
            message,
            processed: false,
            times_marked: 0,
        });

        alert_id
    }

    /// Whether the notification for `alert_id` has been committed as processed.
    pub fn is_processed(&self, alert_id: i64) -> bool {
        self.tables
            .lock()
            .queue
            .iter()
            .any(|n| n.alert_id == alert_id && n.processed)
    }

    /// How many committed sessions marked the notification for `alert_id` processed.
    pub fn times_marked(&self, alert_id: i64) -> usize {
        self.tables
            .lock()
            .queue
            .iter()
            .filter(|n| n.alert_id == alert_id)
            .map(|n| n.times_marked)
            .sum()
    }

    pub fn unprocessed_count(&self) -> usize {
        self.tables.lock().queue.iter().filter(|n| !n.processed).count()
    }

    /// Number of `begin` calls, successful or not.
    pub fn begin_attempts(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    /// Sessions handed out and not yet committed, rolled back or dropped.
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    pub fn fail_next_begins(&self, count: usize) {
        self.failures.begins.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_pings(&self, count: usize) {
        self.failures.pings.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_fetches(&self, count: usize) {
        self.failures.fetches.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_marks(&self, count: usize) {
        self.failures.marks.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_commits(&self, count: usize) {
        self.failures.commits.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn NotificationSession>> {
        self.begins.fetch_add(1, Ordering::SeqCst);

        if take(&self.failures.begins) {
            return Err(StoreError::ConnectionError {
                error: sqlx::Error::PoolTimedOut,
            });
        }

        self.open_sessions.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemorySession {
            store: self.clone(),
            marked: Vec::new(),
            aborted: false,
        }))
    }
}

/// Marks are staged in the session and applied on commit, mirroring a database transaction.
///
/// Like a PostgreSQL transaction, a session whose statement failed is aborted: later statements
/// and the commit fail, and nothing staged is applied.
pub struct MemorySession {
    store: MemoryStore,
    marked: Vec<i64>,
    aborted: bool,
}

fn aborted_error(command: &'static str) -> StoreError {
    StoreError::query(
        command,
        sqlx::Error::Protocol("current transaction is aborted".to_owned()),
    )
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.store.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl NotificationSession for MemorySession {
    async fn fetch_unprocessed(&mut self) -> StoreResult<Vec<NotificationRecord>> {
        if self.aborted {
            return Err(aborted_error("SELECT"));
        }
        if take(&self.store.failures.fetches) {
            self.aborted = true;
            return Err(StoreError::query(
                "SELECT",
                sqlx::Error::Protocol("injected fetch failure".to_owned()),
            ));
        }

        Ok(self.store.tables.lock().unprocessed())
    }

    async fn mark_processed(&mut self, notification_id: i64) -> StoreResult<()> {
        if self.aborted {
            return Err(aborted_error("UPDATE"));
        }
        if take(&self.store.failures.marks) {
            self.aborted = true;
            return Err(StoreError::query(
                "UPDATE",
                sqlx::Error::Protocol("injected update failure".to_owned()),
            ));
        }

        self.marked.push(notification_id);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        if self.aborted {
            return Err(StoreError::CommitError {
                error: sqlx::Error::Protocol("current transaction is aborted".to_owned()),
            });
        }
        if take(&self.store.failures.commits) {
            return Err(StoreError::CommitError {
                error: sqlx::Error::Protocol("injected commit failure".to_owned()),
            });
        }

        let mut tables = self.store.tables.lock();
        for notification in tables.queue.iter_mut() {
            if self.marked.contains(&notification.id) {
                notification.processed = true;
                notification.times_marked += 1;
            }
        }

        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        if take(&self.failures.pings) {
            return Err(StoreError::ConnectionError {
                error: sqlx::Error::PoolTimedOut,
            });
        }
        Ok(())
    }

    async fn recent_alerts(&self, limit: i64) -> StoreResult<Vec<AlertSummary>> {
        let tables = self.tables.lock();
        let mut alerts: Vec<AlertSummary> = tables
            .alerts
            .iter()
            .filter_map(|alert| {
                let person = tables.persons.iter().find(|p| p.id == alert.person_id)?;
                Some(AlertSummary {
                    id: alert.id,
                    person_id: person.id,
                    camera_location: alert.camera_location.clone(),
                    video_id: alert.video_id.clone(),
                    confidence_score: alert.confidence_score,
                    detection_time: alert.detection_time,
                    name: person.name.clone(),
                    threat_level: person.threat_level.clone(),
                })
            })
            .collect();

        alerts.sort_by(|a, b| {
            b.detection_time
                .cmp(&a.detection_time)
                .then_with(|| b.id.cmp(&a.id))
        });
        alerts.truncate(usize::try_from(limit).unwrap_or(0));

        Ok(alerts)
    }

    async fn blacklisted_persons(&self, limit: i64) -> StoreResult<Vec<BlacklistedPerson>> {
        let tables = self.tables.lock();
        Ok(tables
            .persons
            .iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn seed_blacklisted_persons(&self) -> StoreResult<()> {
        for (name, threat_level) in SAMPLE_BLACKLISTED_PERSONS {
            self.add_person(name, threat_level);
        }
        Ok(())
    }

    async fn insert_alert(&self, alert: NewAlert) -> StoreResult<i64> {
        Ok(self.add_alert(alert))
    }
}
