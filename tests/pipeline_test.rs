//! End-to-end ingest and query scenarios against a real SQLite store

use async_trait::async_trait;
use fleet_tracker::domain::{GeoPoint, Geofence, GeofenceEvent, LocationReport};
use fleet_tracker::infra::Metrics;
use fleet_tracker::io::{EventPublisher, PublishError, SqliteLocationStore, StoreConfig};
use fleet_tracker::services::ingest::Ingested;
use fleet_tracker::services::{IngestPipeline, QueryError, QueryService};
use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Default)]
struct RecordingPublisher {
    events: Mutex<Vec<GeofenceEvent>>,
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &GeofenceEvent) -> Result<(), PublishError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

struct Fixture {
    _dir: TempDir,
    publisher: Arc<RecordingPublisher>,
    metrics: Arc<Metrics>,
    pipeline: IngestPipeline,
    query: QueryService,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.db");
    let store = Arc::new(
        SqliteLocationStore::open(path.to_str().unwrap(), &StoreConfig::default()).unwrap(),
    );
    let publisher = Arc::new(RecordingPublisher::default());
    let metrics = Arc::new(Metrics::new());
    let fence = Geofence::new(GeoPoint::new(-6.1751, 106.8270), 50.0);

    Fixture {
        _dir: dir,
        publisher: publisher.clone(),
        metrics: metrics.clone(),
        pipeline: IngestPipeline::new(store.clone(), publisher, fence, metrics.clone()),
        query: QueryService::new(store, metrics),
    }
}

fn payload(vehicle_id: &str, lat: f64, lon: f64, ts: i64) -> Vec<u8> {
    format!(r#"{{"vehicle_id":"{vehicle_id}","latitude":{lat},"longitude":{lon},"timestamp":{ts}}}"#)
        .into_bytes()
}

#[tokio::test]
async fn scenario_report_at_fence_center_emits_one_entry() {
    let f = fixture();

    let outcome = f.pipeline.process(&payload("B1", -6.1751, 106.8270, 1000)).await.unwrap();

    assert_eq!(outcome, Ingested::GeofenceEntry { published: true });
    let events = f.publisher.events.lock().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event.as_str(), "geofence_entry");
    assert_eq!(events[0].location, GeoPoint::new(-6.1751, 106.8270));
    assert_eq!(
        f.query.get_last("B1").await.unwrap(),
        LocationReport::new("B1", -6.1751, 106.8270, 1000)
    );
}

#[tokio::test]
async fn scenario_report_far_outside_is_stored_silently() {
    let f = fixture();

    f.pipeline.ingest(&payload("B1", -6.50, 106.80, 1000)).await;

    assert!(f.publisher.events.lock().is_empty());
    let stored = f.query.get_history("B1", 1000, 1000).await.unwrap();
    assert_eq!(stored, vec![LocationReport::new("B1", -6.50, 106.80, 1000)]);
}

#[tokio::test]
async fn scenario_unknown_vehicle_is_not_found() {
    let f = fixture();
    assert!(matches!(f.query.get_last("B2").await, Err(QueryError::NotFound { .. })));
}

#[tokio::test]
async fn scenario_history_sorted_regardless_of_arrival() {
    let f = fixture();
    for ts in [100, 300, 200] {
        f.pipeline.ingest(&payload("B3", -6.50, 106.80, ts)).await;
    }

    let history = f.query.get_history("B3", 100, 300).await.unwrap();
    let timestamps: Vec<i64> = history.iter().map(|r| r.timestamp).collect();
    assert_eq!(timestamps, vec![100, 200, 300]);
}

#[tokio::test]
async fn scenario_inverted_range_is_empty_not_error() {
    let f = fixture();
    f.pipeline.ingest(&payload("B3", -6.50, 106.80, 150)).await;

    assert!(f.query.get_history("B3", 300, 100).await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_reports_never_reach_store_or_publisher() {
    let f = fixture();
    let invalid = [
        payload("B1", 200.0, 106.8270, 1000),
        payload("B1", -6.1751, 180.0001, 1000),
        payload("", -6.1751, 106.8270, 1000),
        b"{\"vehicle_id\":\"B1\"}".to_vec(),
    ];

    for _ in 0..3 {
        for raw in &invalid {
            f.pipeline.ingest(raw).await;
        }
    }

    assert!(f.publisher.events.lock().is_empty());
    assert!(f.query.get_history("B1", i64::MIN, i64::MAX).await.unwrap().is_empty());
    let totals = f.metrics.totals();
    assert_eq!(totals.messages_received, 12);
    assert_eq!(totals.dropped(), 12);
    assert_eq!(totals.reports_stored, 0);
}

#[tokio::test]
async fn boundary_coordinates_are_accepted() {
    let f = fixture();
    for (i, (lat, lon)) in [(90.0, 180.0), (-90.0, -180.0)].into_iter().enumerate() {
        f.pipeline.process(&payload("EDGE", lat, lon, i as i64)).await.unwrap();
    }
    assert_eq!(f.query.get_history("EDGE", 0, 1).await.unwrap().len(), 2);
}
