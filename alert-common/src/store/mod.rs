//! The storage collaborator: the queue of alert notifications and the alert tables behind it.
//!
//! The notifier never touches tables directly. It opens a `NotificationSession` once per poll
//! cycle, reads the unprocessed notifications, marks each one processed, and commits once.
//! Dropping a session without committing rolls back whatever it marked.
use async_trait::async_trait;
use thiserror::Error;

use crate::alert::{AlertSummary, BlacklistedPerson, NewAlert, NotificationRecord};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgNotificationStore;

/// Enumeration of errors for operations against the alert storage.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: String,
        error: sqlx::Error,
    },
    #[error("transaction commit failed with: {error}")]
    CommitError { error: sqlx::Error },
    #[error("transaction rollback failed with: {error}")]
    RollbackError { error: sqlx::Error },
}

impl StoreError {
    /// A short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::ConnectionError { .. } => "connection",
            StoreError::QueryError { .. } => "query",
            StoreError::CommitError { .. } => "commit",
            StoreError::RollbackError { .. } => "rollback",
        }
    }

    pub(crate) fn query(command: &str, error: sqlx::Error) -> Self {
        StoreError::QueryError {
            command: command.to_owned(),
            error,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One transaction against the notification queue, scoped to a single poll cycle.
#[async_trait]
pub trait NotificationSession: Send {
    /// Read every notification not yet processed, joined with its alert and person.
    async fn fetch_unprocessed(&mut self) -> StoreResult<Vec<NotificationRecord>>;

    /// Mark a notification processed. Only visible to others after `commit`.
    async fn mark_processed(&mut self, notification_id: i64) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Hands out `NotificationSession`s. Fails with `StoreError::ConnectionError` when storage is
/// unreachable.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn NotificationSession>>;
}

/// Plain data access used by the HTTP surface, outside of the notification flow.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Check storage can be reached.
    async fn ping(&self) -> StoreResult<()>;

    /// The latest alerts, newest first.
    async fn recent_alerts(&self, limit: i64) -> StoreResult<Vec<AlertSummary>>;

    async fn blacklisted_persons(&self, limit: i64) -> StoreResult<Vec<BlacklistedPerson>>;

    /// Insert the sample blacklisted persons used when simulating detections on an empty database.
    async fn seed_blacklisted_persons(&self) -> StoreResult<()>;

    /// Record a detection and return its alert id. Storage enqueues the matching notification.
    async fn insert_alert(&self, alert: NewAlert) -> StoreResult<i64>;
}

/// The persons inserted by `AlertStore::seed_blacklisted_persons`.
pub const SAMPLE_BLACKLISTED_PERSONS: [(&str, &str); 3] = [
    ("John Dangerous", "HIGH"),
    ("Jane Suspect", "MEDIUM"),
    ("Bob Criminal", "HIGH"),
];
