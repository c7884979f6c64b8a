//! RabbitMQ publisher for geofence entry events, plus the alert consumer
//!
//! Topology (declared idempotently on connect):
//! - durable topic exchange (`fleet.events` by default)
//! - durable queue (`geofence_alerts`) bound with `geofence.#`
//!
//! Events are published persistent with routing key `geofence.entry` on a
//! channel in confirm mode. A publish is only `Ok` once the broker has acked.

use crate::domain::GeofenceEvent;
use crate::infra::config::Config;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Routing key for every geofence entry event
pub const GEOFENCE_ROUTING_KEY: &str = "geofence.entry";

/// Binding pattern for the alert queue
pub const GEOFENCE_BINDING_KEY: &str = "geofence.#";

const CONSUMER_TAG: &str = "fleet-tracker-geofence-alerts";

/// AMQP persistent delivery mode
const DELIVERY_MODE_PERSISTENT: u8 = 2;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("amqp error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("broker rejected message")]
    Nacked,

    #[error("publish not confirmed within {0:?}")]
    Timeout(Duration),
}

/// Hands geofence events to the message broker
///
/// `Ok` means the broker has accepted the message durably.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &GeofenceEvent) -> Result<(), PublishError>;
}

/// Connection settings for [`AmqpPublisher`]
#[derive(Debug, Clone)]
pub struct AmqpSettings {
    pub url: String,
    pub exchange: String,
    pub queue: String,
    pub publish_timeout: Duration,
}

impl From<&Config> for AmqpSettings {
    fn from(config: &Config) -> Self {
        Self {
            url: config.amqp_url().to_string(),
            exchange: config.amqp_exchange().to_string(),
            queue: config.amqp_queue().to_string(),
            publish_timeout: Duration::from_millis(config.amqp_publish_timeout_ms()),
        }
    }
}

/// Serialize an event to its JSON wire form
pub fn encode_event(event: &GeofenceEvent) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(event)
}

fn message_properties() -> BasicProperties {
    let timestamp = OffsetDateTime::now_utc().unix_timestamp().max(0) as u64;
    BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
        .with_timestamp(timestamp)
        .with_message_id(Uuid::now_v7().to_string().into())
}

/// Bound a broker round trip; an elapsed deadline becomes `PublishError::Timeout`
async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, PublishError>
where
    F: Future<Output = Result<T, lapin::Error>>,
{
    let result = tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| PublishError::Timeout(deadline))?;
    Ok(result?)
}

/// Publisher over a single confirm-mode channel
pub struct AmqpPublisher {
    connection: Connection,
    channel: Channel,
    settings: AmqpSettings,
}

impl AmqpPublisher {
    /// Connect, declare the exchange/queue/binding and enable publisher confirms
    pub async fn connect(settings: AmqpSettings) -> Result<Self, PublishError> {
        let connection = Connection::connect(&settings.url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &settings.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(
                &settings.queue,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &settings.queue,
                &settings.exchange,
                GEOFENCE_BINDING_KEY,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        info!(
            exchange = %settings.exchange,
            queue = %settings.queue,
            "amqp_connected"
        );

        Ok(Self { connection, channel, settings })
    }

    /// Open a fresh channel on the shared connection (used by the consumer)
    pub async fn open_channel(&self) -> Result<Channel, PublishError> {
        Ok(self.connection.create_channel().await?)
    }

    pub fn queue(&self) -> &str {
        &self.settings.queue
    }

    pub async fn close(&self) {
        if let Err(e) = self.connection.close(200, "shutdown").await {
            warn!(error = %e, "amqp_close_failed");
        }
    }
}

#[async_trait]
impl EventPublisher for AmqpPublisher {
    async fn publish(&self, event: &GeofenceEvent) -> Result<(), PublishError> {
        let payload = encode_event(event)?;
        let deadline = self.settings.publish_timeout;
        let started = Instant::now();

        let confirm = with_deadline(deadline, async {
            self.channel
                .basic_publish(
                    &self.settings.exchange,
                    GEOFENCE_ROUTING_KEY,
                    BasicPublishOptions::default(),
                    &payload,
                    message_properties(),
                )
                .await?
                .await
        })
        .await?;

        if confirm.is_nack() {
            return Err(PublishError::Nacked);
        }

        debug!(
            vehicle_id = %event.vehicle_id,
            routing_key = GEOFENCE_ROUTING_KEY,
            latency_us = %started.elapsed().as_micros(),
            "geofence_event_published"
        );
        Ok(())
    }
}

/// Decode one alert delivery and log it. Returns the event when it parsed.
pub fn handle_alert(data: &[u8]) -> Option<GeofenceEvent> {
    match serde_json::from_slice::<GeofenceEvent>(data) {
        Ok(event) => {
            info!(
                vehicle_id = %event.vehicle_id,
                event = event.event.as_str(),
                latitude = format!("{:.6}", event.location.latitude),
                longitude = format!("{:.6}", event.location.longitude),
                timestamp = %event.timestamp,
                "geofence_alert_received"
            );
            Some(event)
        }
        Err(e) => {
            warn!(error = %e, bytes = %data.len(), "geofence_alert_decode_failed");
            None
        }
    }
}

/// Consume the alert queue until shutdown, logging each geofence entry
pub async fn start_geofence_consumer(
    channel: Channel,
    queue: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), PublishError> {
    let mut consumer = channel
        .basic_consume(
            &queue,
            CONSUMER_TAG,
            BasicConsumeOptions { no_ack: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;

    info!(queue = %queue, "geofence_consumer_started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("geofence_consumer_shutdown");
                    return Ok(());
                }
            }
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        handle_alert(&delivery.data);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "geofence_consumer_delivery_error");
                    }
                    None => {
                        warn!(queue = %queue, "geofence_consumer_stream_closed");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LocationReport;

    fn entry() -> GeofenceEvent {
        GeofenceEvent::entry(&LocationReport::new("B1", -6.1751, 106.827, 1000))
    }

    #[test]
    fn test_encode_event_wire_shape() {
        let bytes = encode_event(&entry()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["vehicle_id"], "B1");
        assert_eq!(value["event"], "geofence_entry");
        assert_eq!(value["location"]["latitude"], -6.1751);
        assert_eq!(value["timestamp"], 1000);
    }

    #[test]
    fn test_message_properties_persistent_json() {
        let props = message_properties();
        assert_eq!(props.content_type().as_ref().map(|s| s.as_str()), Some("application/json"));
        assert_eq!(*props.delivery_mode(), Some(DELIVERY_MODE_PERSISTENT));
        assert!(props.timestamp().is_some());

        let id = props.message_id().as_ref().map(|s| s.as_str().to_string()).unwrap();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_ne!(message_properties().message_id(), props.message_id());
    }

    #[test]
    fn test_routing_key_matches_binding() {
        let prefix = GEOFENCE_BINDING_KEY.trim_end_matches('#');
        assert!(GEOFENCE_ROUTING_KEY.starts_with(prefix));
    }

    #[test]
    fn test_handle_alert() {
        let bytes = encode_event(&entry()).unwrap();
        assert_eq!(handle_alert(&bytes), Some(entry()));
        assert_eq!(handle_alert(b"not json"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_publish_times_out() {
        let deadline = Duration::from_secs(5);
        let result = with_deadline(deadline, std::future::pending::<Result<(), lapin::Error>>()).await;
        assert!(matches!(result, Err(PublishError::Timeout(d)) if d == Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_confirm_passes_through() {
        let result = with_deadline(Duration::from_secs(5), async { Ok::<_, lapin::Error>(7) }).await;
        assert!(matches!(result, Ok(7)));
    }

    #[test]
    fn test_settings_from_config() {
        let settings = AmqpSettings::from(&Config::default());
        assert_eq!(settings.exchange, "fleet.events");
        assert_eq!(settings.queue, "geofence_alerts");
        assert_eq!(settings.publish_timeout, Duration::from_secs(5));
    }
}
