//! Embedded MQTT broker using rumqttd
//!
//! Only started when `broker.enabled = true`, so a single binary can run the
//! whole ingest path on a laptop without an external Mosquitto/EMQX.

use crate::infra::config::Config as AppConfig;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Location payloads are a few hundred bytes; anything larger is a bad producer
const MAX_PAYLOAD_SIZE: usize = 16 * 1024;

fn listen_addr(bind_address: &str, port: u16) -> Option<SocketAddr> {
    format!("{}:{}", bind_address, port).parse().ok()
}

fn broker_config(listen: SocketAddr) -> Config {
    let router = RouterConfig {
        max_segment_size: 104_857_600,
        max_segment_count: 10,
        max_connections: 10_010,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: MAX_PAYLOAD_SIZE,
                max_inflight_count: 200,
                auth: None,
                dynamic_filters: false,
                external_auth: None,
            },
        },
    );

    Config {
        id: 0,
        router,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    }
}

/// Start the embedded broker on its own OS thread if enabled.
/// Returns true when a broker was launched.
pub fn start_embedded_broker(app_config: &AppConfig) -> bool {
    if !app_config.broker_enabled() {
        return false;
    }

    let bind_address = app_config.broker_bind_address();
    let port = app_config.broker_port();
    let Some(listen) = listen_addr(bind_address, port) else {
        warn!(bind_address = %bind_address, port = %port, "broker_invalid_bind_address");
        return false;
    };

    let config = broker_config(listen);
    thread::spawn(move || {
        let mut broker = Broker::new(config);
        // start() blocks for the life of the broker
        if let Err(e) = broker.start() {
            warn!(error = %e, "broker_start_failed");
        }
    });

    // Give the listener a moment before the subscriber connects
    thread::sleep(Duration::from_millis(100));
    info!(bind_address = %bind_address, port = %port, "broker_started");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_addr_parses() {
        let addr = listen_addr("127.0.0.1", 1884).unwrap();
        assert_eq!(addr.port(), 1884);
        assert!(listen_addr("not an address", 1884).is_none());
    }

    #[test]
    fn test_disabled_broker_not_started() {
        assert!(!start_embedded_broker(&AppConfig::default()));
    }

    #[test]
    fn test_broker_config_single_v4_listener() {
        let config = broker_config(listen_addr("0.0.0.0", 1883).unwrap());
        let servers = config.v4.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers["v4"].connections.max_payload_size, MAX_PAYLOAD_SIZE);
    }
}
