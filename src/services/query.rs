//! Read-only facade over the location store

use crate::domain::LocationReport;
use crate::infra::metrics::Metrics;
use crate::io::location_store::{LocationStore, StoreError};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no location found for vehicle {vehicle_id}")]
    NotFound { vehicle_id: String },

    #[error("store unavailable: {0}")]
    Store(StoreError),
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { vehicle_id } => QueryError::NotFound { vehicle_id },
            other => QueryError::Store(other),
        }
    }
}

#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn LocationStore>,
    metrics: Arc<Metrics>,
}

impl QueryService {
    pub fn new(store: Arc<dyn LocationStore>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }

    /// Most recent report for the vehicle
    pub async fn get_last(&self, vehicle_id: &str) -> Result<LocationReport, QueryError> {
        let result = self.store.last(vehicle_id).await.map_err(QueryError::from);
        self.record(&result);
        result
    }

    /// Reports within `[start_ts, end_ts]`, ascending. An empty range is `Ok(vec![])`.
    pub async fn get_history(
        &self,
        vehicle_id: &str,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<Vec<LocationReport>, QueryError> {
        let result = self.store.range(vehicle_id, start_ts, end_ts).await.map_err(QueryError::from);
        self.record(&result);
        result
    }

    fn record<T>(&self, result: &Result<T, QueryError>) {
        self.metrics.record_query(matches!(result, Err(QueryError::Store(_))));
    }
}
