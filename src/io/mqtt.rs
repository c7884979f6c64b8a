//! MQTT subscriber feeding the ingest pipeline
//!
//! Every publish on the location topic becomes one independent tokio task.
//! A semaphore caps how many run at once; when it is exhausted the event loop
//! stops polling, which pushes back on the broker instead of queueing in memory.

use crate::infra::config::Config;
use crate::services::ingest::IngestPipeline;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REQUEST_CHANNEL_CAPACITY: usize = 100;

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut options = MqttOptions::new(config.mqtt_client_id(), config.mqtt_host(), config.mqtt_port());
    options.set_keep_alive(KEEP_ALIVE);

    if let Some(username) = config.mqtt_username() {
        options.set_credentials(username, config.mqtt_password().unwrap_or_default());
    }
    options
}

/// Wait out the reconnect delay unless shutdown comes first. True means stop.
async fn backoff_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Subscribe to the location topic and ingest until shutdown
///
/// Resubscribes on every ConnAck so a broker restart does not silently stop
/// ingestion. On shutdown, waits for in-flight ingest tasks to finish.
pub async fn start_mqtt_subscriber(
    config: &Config,
    pipeline: Arc<IngestPipeline>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CHANNEL_CAPACITY);
    let topic = config.mqtt_topic().to_string();

    let max_in_flight = config.ingest_max_in_flight().max(1);
    let permits = Arc::new(Semaphore::new(max_in_flight as usize));

    info!(
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        client_id = %config.mqtt_client_id(),
        topic = %topic,
        max_in_flight = %max_in_flight,
        "mqtt_subscriber_starting"
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    break;
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        debug!(topic = %publish.topic, bytes = %publish.payload.len(), "location_message_received");

                        let permit = permits.clone().acquire_owned().await?;
                        let pipeline = pipeline.clone();
                        let payload = publish.payload;
                        tokio::spawn(async move {
                            pipeline.ingest(&payload).await;
                            drop(permit);
                        });
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(topic = %topic, "mqtt_connected");
                        if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                            error!(error = %e, topic = %topic, "mqtt_subscribe_failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        info!(pkid = %ack.pkid, "mqtt_subscribed");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_connection_error");
                        if backoff_or_shutdown(RECONNECT_DELAY, &mut shutdown).await {
                            info!("mqtt_shutdown");
                            break;
                        }
                    }
                }
            }
        }
    }

    // Drain: every permit back means no ingest task is still running
    let _drained = permits.acquire_many(max_in_flight).await?;
    info!("mqtt_ingest_drained");
    Ok(())
}
