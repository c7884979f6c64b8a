//! IO modules - external system interfaces
//!
//! - `mqtt` - MQTT subscription that feeds the ingest pipeline
//! - `location_store` - SQLite-backed append-only location history
//! - `amqp` - RabbitMQ geofence event publisher and alert consumer
//! - `http_api` - HTTP read API, health and Prometheus metrics

pub mod amqp;
pub mod http_api;
pub mod location_store;
pub mod mqtt;

pub use amqp::{AmqpPublisher, AmqpSettings, EventPublisher, PublishError};
pub use location_store::{LocationStore, SqliteLocationStore, StoreConfig, StoreError};
