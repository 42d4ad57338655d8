//! Uplink: deliver batches of serialized endpoint sketches to the backend.

use crate::config::UplinkConfig;
use crate::error::TransportError;
use crate::store::EncodedSketch;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SKETCHES_PATH: &str = "/api/v1/sketches";

/// One streaming cycle's worth of sketches from this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SketchBatch {
    pub batch_id: Uuid,
    pub device_id: String,
    pub created_at: DateTime<Utc>,
    pub sketches: Vec<EncodedSketch>,
}

impl SketchBatch {
    pub fn new(device_id: impl Into<String>, sketches: Vec<EncodedSketch>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            device_id: device_id.into(),
            created_at: Utc::now(),
            sketches,
        }
    }

    pub fn len(&self) -> usize {
        self.sketches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sketches.is_empty()
    }

    pub fn payload_bytes(&self) -> usize {
        self.sketches.iter().map(|s| s.payload.len()).sum()
    }
}

/// JSON body posted to the backend (sketch payloads base64 encoded).
#[derive(Serialize)]
struct BatchPayload<'a> {
    batch_id: String,
    device_id: &'a str,
    created_at: String,
    sketches: Vec<SketchPayload>,
}

#[derive(Serialize)]
struct SketchPayload {
    endpoint: String,
    payload: String,
}

impl<'a> From<&'a SketchBatch> for BatchPayload<'a> {
    fn from(batch: &'a SketchBatch) -> Self {
        Self {
            batch_id: batch.batch_id.to_string(),
            device_id: &batch.device_id,
            created_at: batch.created_at.to_rfc3339(),
            sketches: batch
                .sketches
                .iter()
                .map(|s| SketchPayload {
                    endpoint: s.endpoint.to_string(),
                    payload: BASE64.encode(&s.payload),
                })
                .collect(),
        }
    }
}

/// Fallible sink for sketch batches. Implementations may block on I/O; the
/// orchestrator only calls them from its flush task.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, batch: &SketchBatch) -> impl Future<Output = Result<(), TransportError>> + Send;
}

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(config: &UplinkConfig) -> Option<Self> {
        let endpoint = config.endpoint.as_ref()?.trim_end_matches('/');
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .ok()?;
        Some(Self {
            client,
            url: format!("{}{}", endpoint, SKETCHES_PATH),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for HttpTransport {
    async fn send(&self, batch: &SketchBatch) -> Result<(), TransportError> {
        let body = BatchPayload::from(batch);
        let res = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }
        debug!(batch_id = %batch.batch_id, sketches = batch.len(), "uplink batch accepted");
        Ok(())
    }
}

/// Uplink chosen from configuration. Offline mode accepts and discards batches.
pub enum Uplink {
    Http(HttpTransport),
    Offline,
}

impl Uplink {
    pub fn from_config(config: &UplinkConfig) -> Self {
        if !config.enabled {
            return Uplink::Offline;
        }
        match HttpTransport::new(config) {
            Some(http) => {
                info!(url = %http.url(), "uplink enabled");
                Uplink::Http(http)
            }
            None => {
                warn!("uplink enabled but client could not be built; running offline");
                Uplink::Offline
            }
        }
    }
}

impl Transport for Uplink {
    async fn send(&self, batch: &SketchBatch) -> Result<(), TransportError> {
        match self {
            Uplink::Http(http) => http.send(batch).await,
            Uplink::Offline => {
                info!(
                    batch_id = %batch.batch_id,
                    sketches = batch.len(),
                    bytes = batch.payload_bytes(),
                    "offline: batch not uploaded"
                );
                Ok(())
            }
        }
    }
}
