//! Services - ingest and read-path logic
//!
//! - `ingest` - Per-message decode, validate, store, geofence, publish
//! - `query` - Last-location and history lookups

pub mod ingest;
pub mod query;

pub use ingest::IngestPipeline;
pub use query::{QueryError, QueryService};
