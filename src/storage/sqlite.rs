//! SQLite-backed implementation of the metric, log, and incident stores.
//!
//! Every query runs on the blocking pool with a pooled connection, so no
//! async task ever holds a database handle across an await point.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::detect::{Incident, IncidentStats, IncidentStatus, IncidentType, NewIncident};
use crate::storage::{open_pool, IncidentStore, Pool, StoreError, TimeSeriesStore};
use crate::telemetry::{LogEntry, LogLevel, Metric};

const INCIDENT_COLUMNS: &str = "id, incident_type, severity, status, detected_at, probable_cause, \
     description, service_name, related_metrics, resolved_at, resolved_by, resolution_notes";

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut *conn)
        })
        .await?
    }
}

fn encode_ts(ts: &DateTime<Utc>) -> String {
    // Fixed-width UTC text keeps lexical and chronological order identical.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("bad timestamp '{}': {}", raw, e)))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn duplicate(service: &str, incident_type: IncidentType) -> StoreError {
    StoreError::DuplicateOpenIncident {
        service: service.to_string(),
        incident_type,
    }
}

fn open_incident_exists(conn: &Connection, service: &str, incident_type: IncidentType) -> Result<bool, StoreError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM incidents
             WHERE service_name = ?1 AND incident_type = ?2 AND status IN ('OPEN', 'INVESTIGATING'))",
        params![service, incident_type.as_str()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn insert_metric(conn: &Connection, m: &Metric) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO metrics (timestamp, metric_name, value, service_name, pod_name, namespace, unit)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            encode_ts(&m.timestamp),
            m.metric_name,
            m.value,
            m.service_name,
            m.pod_name,
            m.namespace,
            m.unit
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_log(conn: &Connection, e: &LogEntry) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO log_entries (timestamp, level, message, service_name, pod_name, namespace, trace_id, span_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            encode_ts(&e.timestamp),
            e.level.as_str(),
            e.message,
            e.service_name,
            e.pod_name,
            e.namespace,
            e.trace_id,
            e.span_id
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

const METRIC_COLUMNS: &str = "timestamp, metric_name, value, service_name, pod_name, namespace, unit";

const LOG_COLUMNS: &str = "timestamp, level, message, service_name, pod_name, namespace, trace_id, span_id";

fn metric_from_row(row: &Row<'_>) -> rusqlite::Result<(String, Metric)> {
    Ok((
        row.get(0)?,
        Metric {
            // Replaced once the text timestamp is decoded.
            timestamp: DateTime::<Utc>::MIN_UTC,
            metric_name: row.get(1)?,
            value: row.get(2)?,
            service_name: row.get(3)?,
            pod_name: row.get(4)?,
            namespace: row.get(5)?,
            unit: row.get(6)?,
        },
    ))
}

fn query_metrics<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Metric>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, metric_from_row)?;

    let mut metrics = Vec::new();
    for r in rows {
        let (ts, metric) = r?;
        metrics.push(metric.at(decode_ts(&ts)?));
    }
    Ok(metrics)
}

fn query_logs<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<LogEntry>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<String>>(7)?,
        ))
    })?;

    let mut entries = Vec::new();
    for r in rows {
        let (ts, level, message, service_name, pod_name, namespace, trace_id, span_id) = r?;
        entries.push(LogEntry {
            timestamp: decode_ts(&ts)?,
            level: level.parse().map_err(StoreError::Decode)?,
            message,
            service_name,
            pod_name,
            namespace,
            trace_id,
            span_id,
        });
    }
    Ok(entries)
}

/// Incident row as stored, before enum and timestamp decoding.
struct IncidentRow {
    id: i64,
    incident_type: String,
    severity: String,
    status: String,
    detected_at: String,
    probable_cause: String,
    description: String,
    service_name: String,
    related_metrics: String,
    resolved_at: Option<String>,
    resolved_by: Option<String>,
    resolution_notes: Option<String>,
}

impl IncidentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            incident_type: row.get(1)?,
            severity: row.get(2)?,
            status: row.get(3)?,
            detected_at: row.get(4)?,
            probable_cause: row.get(5)?,
            description: row.get(6)?,
            service_name: row.get(7)?,
            related_metrics: row.get(8)?,
            resolved_at: row.get(9)?,
            resolved_by: row.get(10)?,
            resolution_notes: row.get(11)?,
        })
    }

    fn decode(self) -> Result<Incident, StoreError> {
        Ok(Incident {
            id: self.id,
            incident_type: self.incident_type.parse().map_err(StoreError::Decode)?,
            severity: self.severity.parse().map_err(StoreError::Decode)?,
            status: self
                .status
                .parse()
                .map_err(|e: crate::detect::DetectError| StoreError::Decode(e.to_string()))?,
            detected_at: decode_ts(&self.detected_at)?,
            probable_cause: self.probable_cause,
            description: self.description,
            service_name: self.service_name,
            related_metrics: self.related_metrics,
            resolved_at: self.resolved_at.as_deref().map(decode_ts).transpose()?,
            resolved_by: self.resolved_by,
            resolution_notes: self.resolution_notes,
        })
    }
}

fn query_incidents<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Incident>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, IncidentRow::from_row)?;

    let mut incidents = Vec::new();
    for r in rows {
        incidents.push(r?.decode()?);
    }
    Ok(incidents)
}

#[async_trait]
impl TimeSeriesStore for SqliteStore {
    async fn record_metric(&self, metric: &Metric) -> Result<i64, StoreError> {
        let metric = metric.clone();
        self.with_conn(move |conn| insert_metric(conn, &metric)).await
    }

    async fn record_metrics(&self, metrics: &[Metric]) -> Result<usize, StoreError> {
        let metrics = metrics.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for m in &metrics {
                insert_metric(&tx, m)?;
            }
            tx.commit()?;
            Ok(metrics.len())
        })
        .await
    }

    async fn record_log(&self, entry: &LogEntry) -> Result<i64, StoreError> {
        let entry = entry.clone();
        self.with_conn(move |conn| insert_log(conn, &entry)).await
    }

    async fn record_logs(&self, entries: &[LogEntry]) -> Result<usize, StoreError> {
        let entries = entries.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for e in &entries {
                insert_log(&tx, e)?;
            }
            tx.commit()?;
            Ok(entries.len())
        })
        .await
    }

    async fn window_average(
        &self,
        metric_name: &str,
        service: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>, StoreError> {
        let (metric_name, service, since) = (metric_name.to_string(), service.to_string(), encode_ts(&since));
        self.with_conn(move |conn| {
            // AVG over zero rows is NULL, which maps to None.
            let avg = conn.query_row(
                "SELECT AVG(value) FROM metrics
                 WHERE metric_name = ?1 AND service_name = ?2 AND timestamp >= ?3",
                params![metric_name, service, since],
                |row| row.get::<_, Option<f64>>(0),
            )?;
            Ok(avg)
        })
        .await
    }

    async fn window_sum(
        &self,
        metric_name: &str,
        service: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>, StoreError> {
        let (metric_name, service, since) = (metric_name.to_string(), service.to_string(), encode_ts(&since));
        self.with_conn(move |conn| {
            let sum = conn.query_row(
                "SELECT SUM(value) FROM metrics
                 WHERE metric_name = ?1 AND service_name = ?2 AND timestamp >= ?3",
                params![metric_name, service, since],
                |row| row.get::<_, Option<f64>>(0),
            )?;
            Ok(sum)
        })
        .await
    }

    async fn count_logs_by_level(
        &self,
        service: &str,
        level: LogLevel,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let (service, since) = (service.to_string(), encode_ts(&since));
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM log_entries
                 WHERE service_name = ?1 AND level = ?2 AND timestamp >= ?3",
                params![service, level.as_str(), since],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn distinct_service_names(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT service_name FROM metrics ORDER BY service_name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn latest_value(&self, metric_name: &str, service: &str) -> Result<Option<Metric>, StoreError> {
        let (metric_name, service) = (metric_name.to_string(), service.to_string());
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM metrics WHERE metric_name = ?1 AND service_name = ?2
                 ORDER BY timestamp DESC, id DESC LIMIT 1",
                METRIC_COLUMNS
            );
            let row = conn
                .query_row(&sql, params![metric_name, service], metric_from_row)
                .optional()?;

            row.map(|(ts, metric)| decode_ts(&ts).map(|t| metric.at(t)))
                .transpose()
        })
        .await
    }

    async fn metrics_for_service(&self, service: &str, since: DateTime<Utc>) -> Result<Vec<Metric>, StoreError> {
        let (service, since) = (service.to_string(), encode_ts(&since));
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM metrics WHERE service_name = ?1 AND timestamp >= ?2
                 ORDER BY timestamp DESC, id DESC",
                METRIC_COLUMNS
            );
            query_metrics(conn, &sql, params![service, since])
        })
        .await
    }

    async fn recent_logs(&self, since: DateTime<Utc>) -> Result<Vec<LogEntry>, StoreError> {
        let since = encode_ts(&since);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM log_entries WHERE timestamp >= ?1 ORDER BY timestamp DESC, id DESC",
                LOG_COLUMNS
            );
            query_logs(conn, &sql, params![since])
        })
        .await
    }

    async fn logs_by_level(
        &self,
        service: &str,
        level: LogLevel,
        since: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let (service, since) = (service.to_string(), encode_ts(&since));
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM log_entries WHERE service_name = ?1 AND level = ?2 AND timestamp >= ?3
                 ORDER BY timestamp DESC, id DESC",
                LOG_COLUMNS
            );
            query_logs(conn, &sql, params![service, level.as_str(), since])
        })
        .await
    }
}

#[async_trait]
impl IncidentStore for SqliteStore {
    async fn has_open_incident(&self, service: &str, incident_type: IncidentType) -> Result<bool, StoreError> {
        let service = service.to_string();
        self.with_conn(move |conn| open_incident_exists(conn, &service, incident_type))
            .await
    }

    async fn create(&self, mut incident: NewIncident) -> Result<Incident, StoreError> {
        incident.detected_at = incident.detected_at.trunc_subsecs(6);
        self.with_conn(move |conn| {
            // IMMEDIATE takes the write lock up front, so check and insert are one unit.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if open_incident_exists(&tx, &incident.service_name, incident.incident_type)? {
                return Err(duplicate(&incident.service_name, incident.incident_type));
            }

            let inserted = tx.execute(
                "INSERT INTO incidents (incident_type, severity, status, detected_at, probable_cause,
                     description, service_name, related_metrics)
                 VALUES (?1, ?2, 'OPEN', ?3, ?4, ?5, ?6, ?7)",
                params![
                    incident.incident_type.as_str(),
                    incident.severity.as_str(),
                    encode_ts(&incident.detected_at),
                    incident.probable_cause,
                    incident.description,
                    incident.service_name,
                    incident.related_metrics
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(e) if is_constraint_violation(&e) => {
                    return Err(duplicate(&incident.service_name, incident.incident_type));
                }
                Err(e) => return Err(e.into()),
            }

            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(incident.into_incident(id))
        })
        .await
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Incident>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM incidents WHERE id = ?1", INCIDENT_COLUMNS);
            let row = conn.query_row(&sql, params![id], IncidentRow::from_row).optional()?;
            row.map(IncidentRow::decode).transpose()
        })
        .await
    }

    async fn find_all(&self) -> Result<Vec<Incident>, StoreError> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM incidents ORDER BY detected_at DESC, id DESC",
                INCIDENT_COLUMNS
            );
            query_incidents(conn, &sql, [])
        })
        .await
    }

    async fn find_by_status(&self, statuses: &[IncidentStatus]) -> Result<Vec<Incident>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<&'static str> = statuses.iter().map(|s| s.as_str()).collect();
        self.with_conn(move |conn| {
            let placeholders = vec!["?"; values.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM incidents WHERE status IN ({}) ORDER BY detected_at DESC, id DESC",
                INCIDENT_COLUMNS, placeholders
            );
            query_incidents(conn, &sql, rusqlite::params_from_iter(values))
        })
        .await
    }

    async fn find_by_service(&self, service: &str) -> Result<Vec<Incident>, StoreError> {
        let service = service.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM incidents WHERE service_name = ?1 ORDER BY detected_at DESC, id DESC",
                INCIDENT_COLUMNS
            );
            query_incidents(conn, &sql, params![service])
        })
        .await
    }

    async fn find_by_type(&self, incident_type: IncidentType) -> Result<Vec<Incident>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM incidents WHERE incident_type = ?1 ORDER BY detected_at DESC, id DESC",
                INCIDENT_COLUMNS
            );
            query_incidents(conn, &sql, params![incident_type.as_str()])
        })
        .await
    }

    async fn update(&self, incident: &Incident) -> Result<(), StoreError> {
        let incident = incident.clone();
        self.with_conn(move |conn| {
            // Only lifecycle fields are mutable; type, severity and detected_at never change.
            let updated = conn.execute(
                "UPDATE incidents SET status = ?1, resolved_at = ?2, resolved_by = ?3, resolution_notes = ?4
                 WHERE id = ?5",
                params![
                    incident.status.as_str(),
                    incident.resolved_at.as_ref().map(encode_ts),
                    incident.resolved_by,
                    incident.resolution_notes,
                    incident.id
                ],
            );
            match updated {
                Ok(_) => Ok(()),
                Err(e) if is_constraint_violation(&e) => {
                    Err(duplicate(&incident.service_name, incident.incident_type))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn stats(&self) -> Result<IncidentStats, StoreError> {
        self.with_conn(|conn| {
            let counts = conn.query_row(
                "SELECT
                     COALESCE(SUM(status = 'OPEN'), 0),
                     COALESCE(SUM(status = 'INVESTIGATING'), 0),
                     COALESCE(SUM(status = 'RESOLVED'), 0),
                     COALESCE(SUM(status IN ('OPEN', 'INVESTIGATING') AND severity = 'CRITICAL'), 0),
                     COALESCE(SUM(status IN ('OPEN', 'INVESTIGATING') AND severity = 'HIGH'), 0)
                 FROM incidents",
                [],
                |row| {
                    Ok([
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ])
                },
            )?;
            let [open, investigating, resolved, critical_open, high_open] = counts.map(|c| c.max(0) as u64);
            Ok(IncidentStats {
                open,
                investigating,
                resolved,
                critical_open,
                high_open,
            })
        })
        .await
    }
}
