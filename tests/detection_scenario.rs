//! End-to-end detection scenarios against a real SQLite store.

use std::time::Duration as StdDuration;

use axum::{http::StatusCode, routing::post, Json, Router};
use chrono::{Duration, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use incidentbot::config::{AlertingConfig, AppConfig, StorageConfig};
use incidentbot::detect::{IncidentStatus, IncidentType, Severity};
use incidentbot::storage::TimeSeriesStore;
use incidentbot::telemetry::names::{CPU_USAGE_PERCENT, LATENCY_MS, MEMORY_USAGE_PERCENT};
use incidentbot::telemetry::{LogEntry, LogLevel, Metric};
use incidentbot::Components;

fn components(dir: &tempfile::TempDir) -> Components {
    let config = AppConfig {
        storage: StorageConfig {
            db_path: dir.path().join("scenario.db"),
        },
        alerting: AlertingConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    Components::build(&config).unwrap()
}

#[tokio::test]
async fn test_checkout_cpu_spike_opens_one_incident() {
    let dir = tempfile::tempdir().unwrap();
    let c = components(&dir);

    for _ in 0..3 {
        c.store
            .record_metric(&Metric::new(CPU_USAGE_PERCENT, 95.0, "checkout"))
            .await
            .unwrap();
    }

    let first = c.scheduler.trigger_now().await.unwrap();
    assert_eq!(first.services, 1);
    assert_eq!(first.incidents_created, 1);

    let open = c.incidents.list_open().await.unwrap();
    assert_eq!(open.len(), 1);
    let incident = &open[0];
    assert_eq!(incident.incident_type, IncidentType::ResourceExhaustion);
    assert_eq!(incident.severity, Severity::High);
    assert_eq!(incident.service_name, "checkout");
    assert!(incident.description.contains("CPU usage is 95.00%"));
    assert!(incident.related_metrics.contains("cpu_usage_percent"));

    let second = c.scheduler.trigger_now().await.unwrap();
    assert_eq!(second.incidents_created, 0);
    assert_eq!(c.incidents.list_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_resolved_incident_allows_new_one() {
    let dir = tempfile::tempdir().unwrap();
    let c = components(&dir);

    c.store
        .record_metric(&Metric::new(MEMORY_USAGE_PERCENT, 97.0, "payments"))
        .await
        .unwrap();
    c.scheduler.trigger_now().await.unwrap();

    let open = c.incidents.list_open().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].severity, Severity::Critical);

    let resolved = c
        .incidents
        .update_status(open[0].id, "RESOLVED", Some("oncall".into()), Some("restarted".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.status, IncidentStatus::Resolved);
    assert!(resolved.resolved_at.is_some());

    let again = c.scheduler.trigger_now().await.unwrap();
    assert_eq!(again.incidents_created, 1);

    let stats = c.incidents.stats().await.unwrap();
    assert_eq!(stats.open, 1);
    assert_eq!(stats.resolved, 1);
    assert_eq!(stats.critical_open, 1);
}

#[tokio::test]
async fn test_stale_samples_fall_outside_window() {
    let dir = tempfile::tempdir().unwrap();
    let c = components(&dir);
    let old = Utc::now() - Duration::minutes(30);

    c.store
        .record_metric(&Metric::new(LATENCY_MS, 9000.0, "search").at(old))
        .await
        .unwrap();
    let summary = c.scheduler.trigger_now().await.unwrap();
    assert_eq!(summary.services, 1);
    assert_eq!(summary.incidents_created, 0);
}

#[tokio::test]
async fn test_error_log_flood_opens_medium_incident() {
    let dir = tempfile::tempdir().unwrap();
    let c = components(&dir);

    // Log volume alone does not register a service; one metric sample does.
    c.store
        .record_metric(&Metric::new(LATENCY_MS, 10.0, "inventory"))
        .await
        .unwrap();
    let entries: Vec<LogEntry> = (0..51)
        .map(|i| LogEntry::new(LogLevel::Error, format!("db timeout #{}", i), "inventory"))
        .collect();
    assert_eq!(c.store.record_logs(&entries).await.unwrap(), 51);

    c.scheduler.trigger_now().await.unwrap();
    let incidents = c.incidents.list_by_service("inventory").await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].incident_type, IncidentType::HighErrorRate);
    assert_eq!(incidents[0].severity, Severity::Medium);
}

#[tokio::test]
async fn test_pass_alert_delivered_before_drain_returns() {
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let app = Router::new().route(
        "/hook",
        post(move |Json(body): Json<Value>| {
            let tx = tx.clone();
            async move {
                // A slow receiver; the alert must still land.
                tokio::time::sleep(StdDuration::from_millis(300)).await;
                let _ = tx.send(body);
                StatusCode::ACCEPTED
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        storage: StorageConfig {
            db_path: dir.path().join("alerting.db"),
        },
        alerting: AlertingConfig {
            enabled: true,
            webhook_url: Some(format!("http://{}/hook", addr)),
            dashboard_url: None,
        },
        ..Default::default()
    };
    let c = Components::build(&config).unwrap();

    c.store
        .record_metric(&Metric::new(CPU_USAGE_PERCENT, 99.0, "checkout"))
        .await
        .unwrap();
    assert_eq!(c.scheduler.trigger_now().await.unwrap().incidents_created, 1);

    assert!(c.alerts.drain(StdDuration::from_secs(5)).await);
    let body = rx.try_recv().unwrap();
    assert_eq!(body["serviceName"], "checkout");
    assert_eq!(body["incidentType"], "RESOURCE_EXHAUSTION");
    assert!(rx.try_recv().is_err());
}
