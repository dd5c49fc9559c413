//! Wire format and network transport for batch delivery.
//!
//! A batch is sent as one JSON document:
//!
//! ```text
//! POST <endpoint>
//! Idempotency-Key: <batch_id>
//!
//! {"schema_version":1,"batch_id":"…","sent_at_ms":…,
//!  "records":[{"id":7,"session_id":"…","category":"metric","key":"arena:kills","payload":{"value":3.0},
//!              "created_at_ms":…,"session_offset_ms":…}]}
//! ```
//!
//! The collector answers with the ids it accepted:
//!
//! ```text
//! {"schema_version":1,"batch_id":"…","accepted":[7]}
//! ```

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{DeliveryError, Result, TelemetryError},
    record::{Batch, Category, Payload, unix_millis},
};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    pub id: u64,
    pub session_id: Uuid,
    pub category: Category,
    pub key: String,
    pub payload: Payload,
    pub created_at_ms: u64,
    pub session_offset_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireBatch {
    pub schema_version: u32,
    pub batch_id: Uuid,
    pub sent_at_ms: u64,
    pub records: Vec<WireRecord>,
}

impl WireBatch {
    pub fn from_batch(batch: &Batch) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            batch_id: batch.id,
            sent_at_ms: unix_millis(SystemTime::now()),
            records: batch
                .records
                .iter()
                .map(|r| WireRecord {
                    id: r.id,
                    session_id: r.session_id,
                    category: r.category,
                    key: r.key.clone(),
                    payload: r.payload.clone(),
                    created_at_ms: r.created_at_ms(),
                    session_offset_ms: r.session_offset.as_millis() as u64,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAck {
    pub schema_version: u32,
    pub batch_id: Uuid,
    pub accepted: Vec<u64>,
}

/// Something that can carry a batch to the collector.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, batch: &WireBatch) -> std::result::Result<WireAck, DeliveryError>;
}

/// POSTs batches as JSON over HTTP(S).
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TelemetryError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &WireBatch) -> std::result::Result<WireAck, DeliveryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", batch.batch_id.to_string())
            .json(batch)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout(self.timeout)
                } else {
                    DeliveryError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status.as_u16()));
        }

        response
            .json::<WireAck>()
            .await
            .map_err(|e| DeliveryError::Decode(e.to_string()))
    }
}
