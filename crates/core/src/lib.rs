pub mod batcher;
pub mod client;
pub mod config;
pub mod deliverer;
pub mod error;
pub mod export;
pub mod prefs;
pub mod queues;
pub mod record;
pub mod spool;
pub mod taxonomy;
pub mod transport;

pub use client::{FlushReport, TelemetryClient};
pub use config::ClientConfig;
pub use deliverer::{DeliveryOutcome, DeliverySnapshot, RetryPolicy};
pub use error::{DeliveryError, Result, SpoolWriteError, TelemetryError, ValidationError};
pub use prefs::{FilePreferences, MemoryPreferences, OPT_IN_KEY, PreferenceStore};
pub use record::{Batch, Category, EventRecord, NewEvent, Payload, PayloadValue, Session};
pub use spool::{CompactionStats, Spool};
pub use taxonomy::{Acquisition, MatchEvent, Resource, Source};
pub use transport::{HttpTransport, SCHEMA_VERSION, Transport, WireAck, WireBatch, WireRecord};
