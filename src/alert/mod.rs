//! Webhook alerting for newly opened incidents.
//!
//! Delivery of a real alert is fire-and-forget: the HTTP request runs on a
//! tracked background task and its outcome is only ever logged. Nothing on
//! the incident-creation path waits for it or learns whether it failed.
//! Short-lived processes call [`WebhookDispatcher::drain`] before exiting.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AlertingConfig;
use crate::detect::{Incident, IncidentType, Severity};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ALERT_TIMEOUT: Duration = Duration::from_secs(30);
const TEST_ALERT_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives every incident the lifecycle manager opens.
///
/// Implementations must return promptly and must not report failure to the
/// caller.
pub trait AlertSink: Send + Sync {
    fn send_alert(&self, incident: &Incident);
}

/// JSON body POSTed to the webhook.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub alert_id: String,
    pub title: String,
    pub message: String,
    pub incident_type: IncidentType,
    pub severity: Severity,
    pub service_name: String,
    pub probable_cause: String,
    pub timestamp: DateTime<Utc>,
    pub incident_id: i64,
    pub dashboard_url: Option<String>,
}

impl AlertPayload {
    pub fn from_incident(incident: &Incident, dashboard_url: Option<&str>) -> Self {
        Self {
            alert_id: Uuid::new_v4().to_string(),
            title: format!(
                "[{}] {} - {}",
                incident.severity,
                incident.incident_type.description(),
                incident.service_name
            ),
            message: incident.description.clone(),
            incident_type: incident.incident_type,
            severity: incident.severity,
            service_name: incident.service_name.clone(),
            probable_cause: incident.probable_cause.clone(),
            timestamp: incident.detected_at,
            incident_id: incident.id,
            dashboard_url: dashboard_url
                .map(|base| format!("{}/incidents/{}", base.trim_end_matches('/'), incident.id)),
        }
    }
}

/// Posts alert payloads to the configured webhook.
pub struct WebhookDispatcher {
    client: Client,
    config: AlertingConfig,
    deliveries: TaskTracker,
}

impl WebhookDispatcher {
    pub fn new(config: AlertingConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            config,
            deliveries: TaskTracker::new(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Number of alert deliveries still in flight.
    pub fn pending_deliveries(&self) -> usize {
        self.deliveries.len()
    }

    /// Wait up to `timeout` for in-flight deliveries; true if all finished.
    pub async fn drain(&self, timeout: Duration) -> bool {
        if self.deliveries.is_empty() {
            return true;
        }
        let pending = self.deliveries.len();
        debug!(pending, "waiting for alert deliveries");

        self.deliveries.close();
        let finished = tokio::time::timeout(timeout, self.deliveries.wait()).await.is_ok();
        self.deliveries.reopen();

        if !finished {
            warn!(
                pending = self.deliveries.len(),
                "alert deliveries still running after drain timeout"
            );
        }
        finished
    }

    /// Synchronously send a fixed test payload; true iff the endpoint answered 2xx.
    pub async fn send_test_alert(&self) -> bool {
        let Some(url) = self.config.webhook_url.as_deref() else {
            warn!("no webhook URL configured, cannot send test alert");
            return false;
        };

        let payload = json!({
            "alertId": "test-alert",
            "title": "Test Alert",
            "message": "This is a test alert from incidentbot",
            "severity": Severity::Low,
            "timestamp": Utc::now(),
        });

        let result = self
            .client
            .post(url)
            .timeout(TEST_ALERT_TIMEOUT)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(resp) => {
                let success = resp.status().is_success();
                info!(status = resp.status().as_u16(), success, "test alert sent");
                success
            }
            Err(e) => {
                error!(error = %e, "error sending test alert");
                false
            }
        }
    }
}

impl AlertSink for WebhookDispatcher {
    fn send_alert(&self, incident: &Incident) {
        if !self.config.enabled {
            debug!(incident_id = incident.id, "alerting is disabled, skipping alert");
            return;
        }
        let Some(url) = self.config.webhook_url.clone() else {
            warn!(incident_id = incident.id, "alerting enabled but no webhook URL configured");
            return;
        };

        let payload = AlertPayload::from_incident(incident, self.config.dashboard_url.as_deref());
        let client = self.client.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(incident_id = payload.incident_id, %url, "queueing alert delivery");
                self.deliveries.spawn_on(deliver(client, url, payload), &handle);
            }
            Err(_) => {
                error!(incident_id = incident.id, "no async runtime available, alert dropped");
            }
        }
    }
}

async fn deliver(client: Client, url: String, payload: AlertPayload) {
    let incident_id = payload.incident_id;
    let result = client.post(&url).timeout(ALERT_TIMEOUT).json(&payload).send().await;

    match result {
        Ok(resp) if resp.status().is_success() => {
            info!(incident_id, alert_id = %payload.alert_id, "alert sent");
        }
        Ok(resp) => {
            warn!(incident_id, status = resp.status().as_u16(), "alert webhook returned non-success status");
        }
        Err(e) => {
            warn!(incident_id, error = %e, "failed to send alert");
        }
    }
}
