//! Append-only location history backed by SQLite
//!
//! One `vehicle_locations` row per accepted report. Rows are never updated
//! or deleted here. The composite `(vehicle_id, timestamp DESC)` index makes
//! "most recent for vehicle" an index-front read and serves range scans.
//!
//! Connections come from an `r2d2` pool and run in WAL mode, so readers
//! never wait on the writer. All SQLite calls run on the blocking pool.

use crate::domain::LocationReport;
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Alias for the connection pool type.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS vehicle_locations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vehicle_id TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    timestamp INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_vehicle_id ON vehicle_locations(vehicle_id);
CREATE INDEX IF NOT EXISTS idx_timestamp ON vehicle_locations(timestamp);
CREATE INDEX IF NOT EXISTS idx_vehicle_timestamp ON vehicle_locations(vehicle_id, timestamp DESC);
";

const INSERT_SQL: &str = "INSERT INTO vehicle_locations (vehicle_id, latitude, longitude, timestamp)
     VALUES (?1, ?2, ?3, ?4)";

// Ties on timestamp resolve to the most recently inserted row.
const LAST_SQL: &str = "SELECT vehicle_id, latitude, longitude, timestamp
     FROM vehicle_locations
     WHERE vehicle_id = ?1
     ORDER BY timestamp DESC, id DESC
     LIMIT 1";

const RANGE_SQL: &str = "SELECT vehicle_id, latitude, longitude, timestamp
     FROM vehicle_locations
     WHERE vehicle_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
     ORDER BY timestamp ASC, id ASC";

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("no location found for vehicle {vehicle_id}")]
    NotFound { vehicle_id: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Time-ordered location history per vehicle
///
/// Implementations must accept concurrent callers; there is no deduplication,
/// so two identical reports become two rows.
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Persist one report
    async fn append(&self, report: &LocationReport) -> Result<(), StoreError>;

    /// Report with the greatest timestamp for the vehicle, or `StoreError::NotFound`
    async fn last(&self, vehicle_id: &str) -> Result<LocationReport, StoreError>;

    /// Reports with `start_ts <= timestamp <= end_ts`, ascending by timestamp.
    /// No match (including `start_ts > end_ts`) is an empty vec, not an error.
    async fn range(
        &self,
        vehicle_id: &str,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<Vec<LocationReport>, StoreError>;
}

/// Configuration for the connection pool.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub pool_size: u32,
    pub busy_timeout_ms: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { pool_size: 8, busy_timeout_ms: 5000 }
    }
}

/// Pragmas applied to every new pooled connection.
#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout_ms: u32,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;\
             PRAGMA busy_timeout = {};\
             PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))
    }
}

fn report_from_row(row: &Row<'_>) -> rusqlite::Result<LocationReport> {
    Ok(LocationReport {
        vehicle_id: row.get(0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        timestamp: row.get(3)?,
    })
}

/// SQLite-backed [`LocationStore`]
#[derive(Clone)]
pub struct SqliteLocationStore {
    pool: ConnectionPool,
}

impl SqliteLocationStore {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: &str, config: &StoreConfig) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .connection_timeout(Duration::from_secs(5))
            .connection_customizer(Box::new(PragmaCustomizer {
                busy_timeout_ms: config.busy_timeout_ms,
            }))
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path, pool_size = %config.pool_size, "location_store_opened");

        Ok(Self { pool })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&*conn)
        })
        .await?
    }
}

#[async_trait]
impl LocationStore for SqliteLocationStore {
    async fn append(&self, report: &LocationReport) -> Result<(), StoreError> {
        let report = report.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(INSERT_SQL)?;
            stmt.execute(params![
                report.vehicle_id,
                report.latitude,
                report.longitude,
                report.timestamp
            ])?;
            Ok(())
        })
        .await
    }

    async fn last(&self, vehicle_id: &str) -> Result<LocationReport, StoreError> {
        let vehicle_id = vehicle_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(LAST_SQL)?;
            let report = stmt.query_row(params![vehicle_id], report_from_row).optional()?;
            report.ok_or(StoreError::NotFound { vehicle_id })
        })
        .await
    }

    async fn range(
        &self,
        vehicle_id: &str,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<Vec<LocationReport>, StoreError> {
        let vehicle_id = vehicle_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(RANGE_SQL)?;
            let rows = stmt.query_map(params![vehicle_id, start_ts, end_ts], report_from_row)?;
            let reports = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(reports)
        })
        .await
    }
}
