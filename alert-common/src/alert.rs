use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The stream subscribers land on when they do not ask for one, and the stream alerts without a
/// `video_id` are published to.
pub const DEFAULT_STREAM: &str = "general";

/// Enumeration of errors raised while turning storage rows into alert messages.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AlertError {
    #[error("{0} is not a valid ThreatLevel")]
    ParseThreatLevelError(String),
}

/// Identifies one logical camera or video feed.
///
/// This is the only place that knows about the `"general"` overload: a missing or blank key and
/// the public `general` stream are the same thing, so every constructor funnels through
/// `StreamKey::normalize`, deserialization included.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "String")]
pub struct StreamKey(String);

impl StreamKey {
    pub fn normalize(key: Option<&str>) -> Self {
        match key.map(str::trim) {
            Some(key) if !key.is_empty() => StreamKey(key.to_owned()),
            _ => StreamKey::general(),
        }
    }

    pub fn general() -> Self {
        StreamKey(DEFAULT_STREAM.to_owned())
    }

    pub fn is_general(&self) -> bool {
        self.0 == DEFAULT_STREAM
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for StreamKey {
    fn default() -> Self {
        StreamKey::general()
    }
}

impl From<&str> for StreamKey {
    fn from(key: &str) -> Self {
        StreamKey::normalize(Some(key))
    }
}

impl From<Option<String>> for StreamKey {
    fn from(key: Option<String>) -> Self {
        StreamKey::normalize(key.as_deref())
    }
}

impl From<StreamKey> for String {
    fn from(key: StreamKey) -> Self {
        key.0
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How dangerous a blacklisted person is considered to be.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
}

/// Allow casting `ThreatLevel` from the strings stored alongside blacklisted persons.
impl FromStr for ThreatLevel {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_ref() {
            "LOW" => Ok(ThreatLevel::Low),
            "MEDIUM" => Ok(ThreatLevel::Medium),
            "HIGH" => Ok(ThreatLevel::High),
            _ => Err(AlertError::ParseThreatLevelError(s.to_owned())),
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ThreatLevel::Low => write!(f, "LOW"),
            ThreatLevel::Medium => write!(f, "MEDIUM"),
            ThreatLevel::High => write!(f, "HIGH"),
        }
    }
}

/// An unprocessed `notification_queue` row joined with its alert and blacklisted person.
/// Fetched, turned into an `AlertMessage`, and dropped within a single poll cycle.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct NotificationRecord {
    pub notification_id: i64,
    pub alert_id: i64,
    pub person_id: i64,
    pub camera_location: String,
    pub video_id: Option<String>,
    pub confidence_score: f64,
    pub detection_time: DateTime<Utc>,
    pub threat_level: String,
    pub person_name: String,
    pub message: String,
    pub processed: bool,
}

/// The JSON payload pushed to subscribers. Field names are part of the public contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub alert_id: i64,
    pub person_name: String,
    pub threat_level: ThreatLevel,
    pub camera_location: String,
    pub video_id: StreamKey,
    pub confidence_score: f64,
    pub detection_time: DateTime<Utc>,
    pub message: String,
}

impl AlertMessage {
    pub fn stream_key(&self) -> &StreamKey {
        &self.video_id
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl TryFrom<&NotificationRecord> for AlertMessage {
    type Error = AlertError;

    fn try_from(record: &NotificationRecord) -> Result<Self, Self::Error> {
        Ok(AlertMessage {
            alert_id: record.alert_id,
            person_name: record.person_name.clone(),
            threat_level: record.threat_level.parse()?,
            camera_location: record.camera_location.clone(),
            video_id: StreamKey::normalize(record.video_id.as_deref()),
            confidence_score: round_confidence(record.confidence_score),
            detection_time: record.detection_time,
            message: record.message.clone(),
        })
    }
}

/// A person detections are matched against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BlacklistedPerson {
    pub id: i64,
    pub name: String,
    pub threat_level: String,
}

/// A row of `security_alerts` joined with the person it matched, as listed by `GET /alerts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlertSummary {
    pub id: i64,
    pub person_id: i64,
    pub camera_location: String,
    pub video_id: Option<String>,
    pub confidence_score: f64,
    pub detection_time: DateTime<Utc>,
    pub name: String,
    pub threat_level: String,
}

/// A detection to be recorded in `security_alerts`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub person_id: i64,
    pub camera_location: String,
    pub video_id: Option<String>,
    pub confidence_score: f64,
}

/// Confidence scores are stored with two decimals; keep floating point noise off the wire.
pub fn round_confidence(score: f64) -> f64 {
    (score * 100.0).round() / 100.0
}
