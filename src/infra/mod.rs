//! Infrastructure - configuration, metrics, and broker
//!
//! - `config` - TOML loading, defaults, environment overrides
//! - `metrics` - Lock-free pipeline counters and latency windows
//! - `broker` - Optional embedded MQTT broker (rumqttd) for local runs

pub mod broker;
pub mod config;
pub mod metrics;

pub use config::Config;
pub use metrics::Metrics;
