//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS metrics (
            id INTEGER PRIMARY KEY,
            timestamp TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            value REAL NOT NULL,
            service_name TEXT NOT NULL,
            pod_name TEXT,
            namespace TEXT,
            unit TEXT
        );

        CREATE TABLE IF NOT EXISTS log_entries (
            id INTEGER PRIMARY KEY,
            timestamp TEXT NOT NULL,
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            service_name TEXT NOT NULL,
            pod_name TEXT,
            namespace TEXT,
            trace_id TEXT,
            span_id TEXT
        );

        CREATE TABLE IF NOT EXISTS incidents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            incident_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'OPEN',
            detected_at TEXT NOT NULL,
            probable_cause TEXT NOT NULL,
            description TEXT NOT NULL,
            service_name TEXT NOT NULL,
            related_metrics TEXT NOT NULL,
            resolved_at TEXT,
            resolved_by TEXT,
            resolution_notes TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_metrics_lookup ON metrics(metric_name, service_name, timestamp);
        CREATE INDEX IF NOT EXISTS idx_metrics_service ON metrics(service_name);
        CREATE INDEX IF NOT EXISTS idx_logs_lookup ON log_entries(service_name, level, timestamp);
        CREATE INDEX IF NOT EXISTS idx_logs_time ON log_entries(timestamp);
        CREATE INDEX IF NOT EXISTS idx_incidents_service ON incidents(service_name);
        CREATE INDEX IF NOT EXISTS idx_incidents_detected ON incidents(detected_at);

        -- At most one OPEN or INVESTIGATING incident per service and type.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_one_open
            ON incidents(service_name, incident_type)
            WHERE status IN ('OPEN', 'INVESTIGATING');

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}
