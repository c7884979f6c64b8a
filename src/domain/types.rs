//! Shared types for the fleet tracker

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Latitude bounds in degrees (inclusive)
pub const LATITUDE_RANGE: (f64, f64) = (-90.0, 90.0);

/// Longitude bounds in degrees (inclusive)
pub const LONGITUDE_RANGE: (f64, f64) = (-180.0, 180.0);

/// A latitude/longitude pair in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// One observed position of one vehicle at one instant
///
/// `timestamp` is producer-supplied Unix epoch seconds. Nothing about it is
/// monotonic, across vehicles or within one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationReport {
    pub vehicle_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: i64,
}

/// Reasons a decoded report is refused before it reaches the store
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("missing vehicle_id")]
    MissingVehicleId,
    #[error("invalid latitude: {0}")]
    LatitudeOutOfRange(f64),
    #[error("invalid longitude: {0}")]
    LongitudeOutOfRange(f64),
}

impl LocationReport {
    pub fn new(vehicle_id: impl Into<String>, latitude: f64, longitude: f64, timestamp: i64) -> Self {
        Self { vehicle_id: vehicle_id.into(), latitude, longitude, timestamp }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    /// Check the storage invariants: non-empty id, coordinates inside their
    /// inclusive ranges. NaN fails both range checks.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.vehicle_id.is_empty() {
            return Err(ValidationError::MissingVehicleId);
        }
        if !(LATITUDE_RANGE.0..=LATITUDE_RANGE.1).contains(&self.latitude) {
            return Err(ValidationError::LatitudeOutOfRange(self.latitude));
        }
        if !(LONGITUDE_RANGE.0..=LONGITUDE_RANGE.1).contains(&self.longitude) {
            return Err(ValidationError::LongitudeOutOfRange(self.longitude));
        }
        Ok(())
    }
}

/// Kind tag carried in the `event` field of a geofence notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeofenceEventKind {
    GeofenceEntry,
}

impl GeofenceEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeofenceEventKind::GeofenceEntry => "geofence_entry",
        }
    }
}

/// Notification derived from a report that fell inside the fence
///
/// Never stored; built and handed to the publisher in the same ingest step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceEvent {
    pub vehicle_id: String,
    pub event: GeofenceEventKind,
    pub location: GeoPoint,
    pub timestamp: i64,
}

impl GeofenceEvent {
    pub fn entry(report: &LocationReport) -> Self {
        Self {
            vehicle_id: report.vehicle_id.clone(),
            event: GeofenceEventKind::GeofenceEntry,
            location: report.point(),
            timestamp: report.timestamp,
        }
    }
}
