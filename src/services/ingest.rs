//! Ingestion pipeline: decode → validate → append → geofence → publish
//!
//! One call per inbound transport message. Every step is a hard gate for
//! that message only; nothing is retried and nothing is reported back to the
//! producer. Publish failures are logged and swallowed, the stored row stays.

use crate::domain::{Geofence, GeofenceEvent, LocationReport, ValidationError};
use crate::infra::metrics::Metrics;
use crate::io::amqp::EventPublisher;
use crate::io::location_store::{LocationStore, StoreError};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Payload is not a JSON `LocationReport`
#[derive(Debug, Error)]
#[error("malformed location payload: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Why a message was dropped before or at the store
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened to a message that made it into the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    /// Stored, outside the fence
    Stored,
    /// Stored and inside the fence; `published` is false when the publish failed
    GeofenceEntry { published: bool },
}

pub fn decode(raw: &[u8]) -> Result<LocationReport, DecodeError> {
    Ok(serde_json::from_slice(raw)?)
}

/// Shared, immutable per-process ingest context
///
/// Cloned handles only; safe to call `ingest` from any number of tasks.
pub struct IngestPipeline {
    store: Arc<dyn LocationStore>,
    publisher: Arc<dyn EventPublisher>,
    geofence: Geofence,
    metrics: Arc<Metrics>,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn LocationStore>,
        publisher: Arc<dyn EventPublisher>,
        geofence: Geofence,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { store, publisher, geofence, metrics }
    }

    /// Fire-and-forget entry point for the transport. Outcome goes to logs and metrics.
    pub async fn ingest(&self, raw: &[u8]) {
        self.metrics.record_message_received();

        match self.process(raw).await {
            Ok(_) => {}
            Err(IngestError::Decode(e)) => {
                self.metrics.record_decode_failed();
                warn!(error = %e, bytes = %raw.len(), "location_decode_failed");
            }
            Err(IngestError::Validation(e)) => {
                self.metrics.record_validation_failed();
                warn!(error = %e, "location_validation_failed");
            }
            Err(IngestError::Store(e)) => {
                self.metrics.record_store_failed();
                error!(error = %e, "location_store_failed");
            }
        }
    }

    /// Run every gate for one message and return how far it got
    pub async fn process(&self, raw: &[u8]) -> Result<Ingested, IngestError> {
        let report = decode(raw)?;
        report.validate()?;

        let started = Instant::now();
        self.store.append(&report).await?;
        self.metrics.record_report_stored(started.elapsed().as_micros() as u64);
        debug!(
            vehicle_id = %report.vehicle_id,
            timestamp = %report.timestamp,
            "location_stored"
        );

        if !self.geofence.contains(report.point()) {
            return Ok(Ingested::Stored);
        }

        self.metrics.record_geofence_entry();
        info!(
            vehicle_id = %report.vehicle_id,
            latitude = %report.latitude,
            longitude = %report.longitude,
            timestamp = %report.timestamp,
            "geofence_entry"
        );

        let event = GeofenceEvent::entry(&report);
        let started = Instant::now();
        let published = match self.publisher.publish(&event).await {
            Ok(()) => {
                self.metrics.record_event_published(started.elapsed().as_micros() as u64);
                true
            }
            Err(e) => {
                self.metrics.record_publish_failed();
                error!(vehicle_id = %event.vehicle_id, error = %e, "geofence_event_publish_failed");
                false
            }
        };

        Ok(Ingested::GeofenceEntry { published })
    }
}
