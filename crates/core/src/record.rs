use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Separator between the segments of a namespaced event key.
pub const KEY_DELIMITER: char = ':';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Progression,
    Resource,
    Metric,
    Positional,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Progression,
        Category::Resource,
        Category::Metric,
        Category::Positional,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Progression => "progression",
            Category::Resource => "resource",
            Category::Metric => "metric",
            Category::Positional => "positional",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Number(f64),
    Text(String),
}

impl From<f64> for PayloadValue {
    fn from(value: f64) -> Self {
        PayloadValue::Number(value)
    }
}

impl From<f32> for PayloadValue {
    fn from(value: f32) -> Self {
        PayloadValue::Number(value as f64)
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        PayloadValue::Number(value as f64)
    }
}

impl From<i32> for PayloadValue {
    fn from(value: i32) -> Self {
        PayloadValue::Number(value as f64)
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        PayloadValue::Text(value.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        PayloadValue::Text(value)
    }
}

impl fmt::Display for PayloadValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadValue::Number(n) => write!(f, "{}", n),
            PayloadValue::Text(s) => f.write_str(s),
        }
    }
}

pub type Payload = BTreeMap<String, PayloadValue>;

/// Check a single caller-supplied key segment.
pub fn validate_segment(segment: &str) -> Result<(), ValidationError> {
    if segment.trim().is_empty() {
        return Err(ValidationError::EmptyKey);
    }
    if segment.contains(KEY_DELIMITER) {
        return Err(ValidationError::ReservedDelimiter {
            segment: segment.to_string(),
            delimiter: KEY_DELIMITER,
        });
    }
    Ok(())
}

pub fn validate_payload(payload: &Payload) -> Result<(), ValidationError> {
    for (field, value) in payload {
        if field.trim().is_empty() {
            return Err(ValidationError::EmptyField);
        }
        if let PayloadValue::Number(n) = value
            && !n.is_finite()
        {
            return Err(ValidationError::NonFiniteNumber {
                field: field.clone(),
            });
        }
    }
    Ok(())
}

/// A validated event that has not been assigned a sequence id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub category: Category,
    pub key: String,
    pub payload: Payload,
}

impl NewEvent {
    /// `key` is the fully namespaced key; every segment must be non-empty.
    pub fn new(category: Category, key: String, payload: Payload) -> Result<Self, ValidationError> {
        if key.split(KEY_DELIMITER).any(|s| s.trim().is_empty()) {
            return Err(ValidationError::EmptyKey);
        }
        validate_payload(&payload)?;
        Ok(Self {
            category,
            key,
            payload,
        })
    }
}

/// Identity and monotonic clock of one client session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub started: Instant,
    pub started_at: SystemTime,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started: Instant::now(),
            started_at: SystemTime::now(),
        }
    }

    pub fn offset(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: u64,
    pub session_id: Uuid,
    pub category: Category,
    pub key: String,
    pub payload: Payload,
    pub created_at: SystemTime,
    pub session_offset: Duration,
    #[serde(default)]
    pub acknowledged: bool,
}

impl EventRecord {
    pub fn new(id: u64, session: &Session, event: NewEvent) -> Self {
        Self {
            id,
            session_id: session.id,
            category: event.category,
            key: event.key,
            payload: event.payload,
            created_at: SystemTime::now(),
            session_offset: session.offset(),
            acknowledged: false,
        }
    }

    pub fn created_at_ms(&self) -> u64 {
        unix_millis(self.created_at)
    }

    /// The headline value used by the `key,value` mirror log.
    pub fn headline(&self) -> Option<&PayloadValue> {
        ["value", "amount", "score"]
            .iter()
            .find_map(|field| self.payload.get(*field))
            .or_else(|| self.payload.values().next())
    }
}

pub fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// An ordered, non-empty group of records delivered as one unit.
///
/// The batch id stays the same across every retry of this batch so the
/// collector can drop duplicate sends.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: Uuid,
    pub records: Vec<EventRecord>,
    pub created_at: SystemTime,
}

impl Batch {
    pub fn new(mut records: Vec<EventRecord>) -> Option<Self> {
        if records.is_empty() {
            return None;
        }
        records.sort_by_key(|r| r.id);
        Some(Self {
            id: Uuid::new_v4(),
            records,
            created_at: SystemTime::now(),
        })
    }

    pub fn ids(&self) -> Vec<u64> {
        self.records.iter().map(|r| r.id).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
