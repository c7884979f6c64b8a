//! Domain models - core business types and geofence math
//!
//! This module contains the canonical data types used throughout the system:
//! - `LocationReport` - one observed position of one vehicle
//! - `GeofenceEvent` - notification derived from a report inside the fence
//! - `Geofence` - circular fence with haversine containment

pub mod geofence;
pub mod types;

// Re-export commonly used types at module level
pub use geofence::Geofence;
pub use types::{GeoPoint, GeofenceEvent, GeofenceEventKind, LocationReport, ValidationError};
