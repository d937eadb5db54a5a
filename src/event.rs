use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub type Timestamp = DateTime<Utc>;

/// Forms with an explicit offset. `%#z` takes `Z`, `+HH`, `+HHMM` and `+HH:MM`.
const OFFSET_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f%#z",
    "%Y-%m-%d %H:%M:%S%.f%#z",
    "%Y-%m-%dT%H:%M%#z",
    "%Y%m%dT%H%M%S%#z",
];

/// Offset-less forms, read as UTC.
const NAIVE_FORMATS: [&str; 7] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y%m%dT%H%M%S",
];

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y%m%d"];

/// An event as posted by a site and carried through the queue.
///
/// The timestamp is kept as the client sent it; it is only checked at ingress and
/// converted when the worker builds a [`NewEvent`].
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Event {
    pub site_id: String,
    pub event_type: String,
    pub path: Option<String>,
    pub user_id: Option<String>,
    pub timestamp: String,
}

/// Request body before validation. Every field is optional so that a missing
/// field is reported by name instead of as a generic decode failure.
#[derive(Debug, Deserialize)]
pub struct IncomingEvent {
    pub site_id: Option<String>,
    pub event_type: Option<String>,
    pub path: Option<String>,
    pub user_id: Option<String>,
    pub timestamp: Option<String>,
}

/// A row about to be written to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub site_id: String,
    pub event_type: String,
    pub path: Option<String>,
    pub user_id: Option<String>,
    pub event_ts: Timestamp,
}

/// A row as it exists in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub id: i64,
    pub site_id: String,
    pub event_type: String,
    pub path: Option<String>,
    pub user_id: Option<String>,
    pub event_ts: Timestamp,
    pub ingested_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: &'static str,
}

impl ValidationError {
    fn new(field: &'static str, reason: &'static str) -> Self {
        Self { field, reason }
    }
}

impl IncomingEvent {
    /// Checks the required fields and the timestamp format. Content is passed
    /// through unchanged.
    pub fn validate(self) -> Result<Event, ValidationError> {
        let site_id = required("site_id", self.site_id)?;
        let event_type = required("event_type", self.event_type)?;
        let timestamp = required("timestamp", self.timestamp)?;
        if parse_timestamp(&timestamp).is_none() {
            return Err(ValidationError::new(
                "timestamp",
                "timestamp must be ISO8601, e.g. 2025-11-12T19:30:01Z",
            ));
        }
        Ok(Event {
            site_id,
            event_type,
            path: self.path,
            user_id: self.user_id,
            timestamp,
        })
    }
}

fn required(field: &'static str, value: Option<String>) -> Result<String, ValidationError> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        Some(_) => Err(ValidationError::new(field, "must not be empty")),
        None => Err(ValidationError::new(field, "field required")),
    }
}

/// Parses an ISO-8601 timestamp into a UTC instant.
///
/// Accepts extended and basic forms with second or minute precision. With an
/// offset (a trailing `Z` is UTC) the instant is converted. Without one it is taken
/// as UTC, and a bare calendar date means midnight UTC.
pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Some(ts) = OFFSET_FORMATS
        .iter()
        .find_map(|format| DateTime::parse_from_str(raw, format).ok())
    {
        return Some(ts.with_timezone(&Utc));
    }
    if let Some(naive) = NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
    {
        return Some(naive.and_utc());
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
        .map(|date| date.and_time(NaiveTime::MIN).and_utc())
}
