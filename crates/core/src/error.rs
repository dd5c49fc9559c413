use std::path::PathBuf;

use thiserror::Error;

use crate::record::EventRecord;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("key segment must not be empty")]
    EmptyKey,

    #[error("key segment {segment:?} contains the reserved delimiter '{delimiter}'")]
    ReservedDelimiter { segment: String, delimiter: char },

    #[error("payload field name must not be empty")]
    EmptyField,

    #[error("payload field {field:?} is not a finite number")]
    NonFiniteNumber { field: String },
}

/// A durable append failed. The record was still assigned an id and kept in
/// memory, so the caller can continue buffering it for this session.
///
/// Returned by [`Spool::append`](crate::spool::Spool::append); the client
/// logs it and keeps the record rather than failing `record`.
#[derive(Error, Debug)]
#[error("spool write failed for record {}: {source}", record.id)]
pub struct SpoolWriteError {
    pub record: Box<EventRecord>,
    #[source]
    pub source: std::io::Error,
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("collector returned HTTP {0}")]
    Status(u16),

    #[error("malformed collector response: {0}")]
    Decode(String),

    #[error("collector acknowledged batch {got} while {expected} was sent")]
    BatchMismatch { expected: uuid::Uuid, got: uuid::Uuid },

    #[error("unsupported collector schema version {0}")]
    SchemaMismatch(u32),
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),

    #[error("telemetry client is already initialized for this session")]
    Reinitialization,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("export file already exists: {0}")]
    ExportExists(PathBuf),

    #[error("preference store error: {0}")]
    Preferences(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
