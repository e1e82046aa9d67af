//! SQLite storage layer -- store contracts, schema, queries.

pub mod schema;
pub mod sqlite;

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;

use crate::detect::{Incident, IncidentStats, IncidentStatus, IncidentType, NewIncident};
use crate::telemetry::{LogEntry, LogLevel, Metric};

pub use self::sqlite::SqliteStore;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("corrupt row: {0}")]
    Decode(String),

    /// The open-incident uniqueness rule rejected an insert or reopen.
    #[error("an open {incident_type} incident already exists for service '{service}'")]
    DuplicateOpenIncident {
        service: String,
        incident_type: IncidentType,
    },
}

/// Durable store of metric samples and log entries.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn record_metric(&self, metric: &Metric) -> Result<i64, StoreError>;

    /// Record every metric or none of them.
    async fn record_metrics(&self, metrics: &[Metric]) -> Result<usize, StoreError>;

    async fn record_log(&self, entry: &LogEntry) -> Result<i64, StoreError>;

    async fn record_logs(&self, entries: &[LogEntry]) -> Result<usize, StoreError>;

    /// Mean of `metric_name` for `service` since `since`; `None` when the window is empty.
    async fn window_average(
        &self,
        metric_name: &str,
        service: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>, StoreError>;

    /// Sum of `metric_name` for `service` since `since`; `None` when the window is empty.
    async fn window_sum(
        &self,
        metric_name: &str,
        service: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>, StoreError>;

    async fn count_logs_by_level(
        &self,
        service: &str,
        level: LogLevel,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Every service name that has reported at least one metric.
    async fn distinct_service_names(&self) -> Result<Vec<String>, StoreError>;

    async fn latest_value(&self, metric_name: &str, service: &str) -> Result<Option<Metric>, StoreError>;

    /// Every sample reported by `service` since `since`, newest first.
    async fn metrics_for_service(&self, service: &str, since: DateTime<Utc>) -> Result<Vec<Metric>, StoreError>;

    /// Log entries from all services since `since`, newest first.
    async fn recent_logs(&self, since: DateTime<Utc>) -> Result<Vec<LogEntry>, StoreError>;

    /// Log entries of one level for `service` since `since`, newest first.
    async fn logs_by_level(
        &self,
        service: &str,
        level: LogLevel,
        since: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>, StoreError>;
}

/// Durable store of incidents.
///
/// `create` is the enforcement point for "one open incident per service and
/// type": implementations must make the existence check and the insert a
/// single isolated unit and answer `StoreError::DuplicateOpenIncident` when
/// the rule would be broken. `update` must enforce the same rule when an
/// incident is moved back to an open status.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn has_open_incident(&self, service: &str, incident_type: IncidentType) -> Result<bool, StoreError>;

    async fn create(&self, incident: NewIncident) -> Result<Incident, StoreError>;

    async fn find_by_id(&self, id: i64) -> Result<Option<Incident>, StoreError>;

    /// All incidents, newest first.
    async fn find_all(&self) -> Result<Vec<Incident>, StoreError>;

    async fn find_by_status(&self, statuses: &[IncidentStatus]) -> Result<Vec<Incident>, StoreError>;

    async fn find_by_service(&self, service: &str) -> Result<Vec<Incident>, StoreError>;

    async fn find_by_type(&self, incident_type: IncidentType) -> Result<Vec<Incident>, StoreError>;

    async fn update(&self, incident: &Incident) -> Result<(), StoreError>;

    async fn stats(&self) -> Result<IncidentStats, StoreError>;
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: impl AsRef<Path>) -> Result<Pool> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager).context("failed to build connection pool")?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}
