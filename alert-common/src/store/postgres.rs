use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use super::{
    AlertStore, NotificationSession, NotificationStore, StoreError, StoreResult,
    SAMPLE_BLACKLISTED_PERSONS,
};
use crate::alert::{AlertSummary, BlacklistedPerson, NewAlert, NotificationRecord};

/// The notification queue and alert tables, implemented on top of PostgreSQL.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    /// Initialize a new store backed by the database at `url`.
    /// The pool connects lazily: an unreachable database surfaces on the first `begin`.
    pub fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    /// Initialize a store from an existing pool.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn begin(&self) -> StoreResult<Box<dyn NotificationSession>> {
        let transaction = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Box::new(PgNotificationSession { transaction }))
    }
}

/// A poll cycle's transaction. Rows read are locked until commit so a second notifier pointed
/// at the same database skips them instead of delivering them twice.
pub struct PgNotificationSession {
    transaction: Transaction<'static, Postgres>,
}

#[async_trait]
impl NotificationSession for PgNotificationSession {
    async fn fetch_unprocessed(&mut self) -> StoreResult<Vec<NotificationRecord>> {
        let query = r#"
SELECT
    nq.id AS notification_id,
    nq.alert_id,
    sa.person_id,
    sa.camera_location,
    sa.video_id,
    sa.confidence_score::float8 AS confidence_score,
    sa.detection_time,
    bp.threat_level,
    bp.name AS person_name,
    nq.message,
    nq.processed
FROM
    notification_queue nq
    JOIN security_alerts sa ON nq.alert_id = sa.id
    JOIN blacklisted_persons bp ON sa.person_id = bp.id
WHERE
    nq.processed = FALSE
ORDER BY
    nq.id
FOR UPDATE OF nq SKIP LOCKED
        "#;

        sqlx::query_as(query)
            .fetch_all(&mut *self.transaction)
            .await
            .map_err(|error| StoreError::query("SELECT", error))
    }

    async fn mark_processed(&mut self, notification_id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE notification_queue SET processed = TRUE WHERE id = $1")
            .bind(notification_id)
            .execute(&mut *self.transaction)
            .await
            .map_err(|error| StoreError::query("UPDATE", error))?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.transaction
            .commit()
            .await
            .map_err(|error| StoreError::CommitError { error })
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.transaction
            .rollback()
            .await
            .map_err(|error| StoreError::RollbackError { error })
    }
}

#[async_trait]
impl AlertStore for PgNotificationStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(())
    }

    async fn recent_alerts(&self, limit: i64) -> StoreResult<Vec<AlertSummary>> {
        let query = r#"
SELECT
    sa.id,
    sa.person_id,
    sa.camera_location,
    sa.video_id,
    sa.confidence_score::float8 AS confidence_score,
    sa.detection_time,
    bp.name,
    bp.threat_level
FROM
    security_alerts sa
    JOIN blacklisted_persons bp ON sa.person_id = bp.id
ORDER BY
    sa.detection_time DESC,
    sa.id DESC
LIMIT $1
        "#;

        sqlx::query_as(query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::query("SELECT", error))
    }

    async fn blacklisted_persons(&self, limit: i64) -> StoreResult<Vec<BlacklistedPerson>> {
        let query = r#"
SELECT id, name, threat_level
FROM blacklisted_persons
ORDER BY id
LIMIT $1
        "#;

        sqlx::query_as(query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::query("SELECT", error))
    }

    async fn seed_blacklisted_persons(&self) -> StoreResult<()> {
        let mut transaction = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        for (name, threat_level) in SAMPLE_BLACKLISTED_PERSONS {
            sqlx::query("INSERT INTO blacklisted_persons (name, threat_level) VALUES ($1, $2)")
                .bind(name)
                .bind(threat_level)
                .execute(&mut *transaction)
                .await
                .map_err(|error| StoreError::query("INSERT", error))?;
        }

        transaction
            .commit()
            .await
            .map_err(|error| StoreError::CommitError { error })
    }

    async fn insert_alert(&self, alert: NewAlert) -> StoreResult<i64> {
        let query = r#"
INSERT INTO security_alerts
    (person_id, camera_location, video_id, confidence_score)
VALUES
    ($1, $2, $3, $4::numeric)
RETURNING
    id
        "#;

        let (alert_id,): (i64,) = sqlx::query_as(query)
            .bind(alert.person_id)
            .bind(&alert.camera_location)
            .bind(&alert.video_id)
            .bind(alert.confidence_score)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::query("INSERT", error))?;

        Ok(alert_id)
    }
}
