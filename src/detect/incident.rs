use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tracing::info;

use crate::alert::AlertSink;
use crate::detect::cause::analyze_cause;
use crate::detect::{DetectError, Incident, IncidentStats, IncidentStatus, IncidentType, NewIncident, Severity};
use crate::storage::{IncidentStore, StoreError};

/// What a rule asks the lifecycle manager to open.
#[derive(Debug, Clone)]
pub struct IncidentRequest {
    pub incident_type: IncidentType,
    pub severity: Severity,
    pub service_name: String,
    /// Falls back to the type's canonical description when `None`.
    pub description: Option<String>,
    pub related_metrics: String,
}

/// Owns incident creation (with dedup) and status transitions.
pub struct IncidentManager {
    store: Arc<dyn IncidentStore>,
    alerts: Arc<dyn AlertSink>,
}

impl IncidentManager {
    pub fn new(store: Arc<dyn IncidentStore>, alerts: Arc<dyn AlertSink>) -> Self {
        Self { store, alerts }
    }

    /// Open an incident unless one is already OPEN or INVESTIGATING for the
    /// same service and type, in which case `Ok(None)` is returned.
    pub async fn create_incident(&self, req: IncidentRequest) -> Result<Option<Incident>, DetectError> {
        if self
            .store
            .has_open_incident(&req.service_name, req.incident_type)
            .await?
        {
            info!(
                service = %req.service_name,
                incident_type = %req.incident_type,
                "open incident already exists, suppressing"
            );
            return Ok(None);
        }

        let description = req
            .description
            .unwrap_or_else(|| req.incident_type.description().to_string());
        let probable_cause = analyze_cause(req.incident_type, &req.related_metrics, &description);

        let new = NewIncident {
            incident_type: req.incident_type,
            severity: req.severity,
            detected_at: now(),
            probable_cause,
            description,
            service_name: req.service_name,
            related_metrics: req.related_metrics,
        };

        let incident = match self.store.create(new).await {
            Ok(incident) => incident,
            // A concurrent pass won the race between our check and the insert.
            Err(StoreError::DuplicateOpenIncident { service, incident_type }) => {
                info!(%service, %incident_type, "open incident created concurrently, suppressing");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            incident_id = incident.id,
            severity = %incident.severity,
            incident_type = %incident.incident_type,
            service = %incident.service_name,
            probable_cause = %incident.probable_cause,
            "created incident"
        );

        self.alerts.send_alert(&incident);

        Ok(Some(incident))
    }

    /// Move an incident to `status` (case-insensitive). Unknown status strings
    /// are rejected before the incident is looked up; an unknown id yields `Ok(None)`.
    pub async fn update_status(
        &self,
        id: i64,
        status: &str,
        resolved_by: Option<String>,
        resolution_notes: Option<String>,
    ) -> Result<Option<Incident>, DetectError> {
        let status: IncidentStatus = status.parse()?;

        let Some(mut incident) = self.store.find_by_id(id).await? else {
            return Ok(None);
        };

        match status {
            IncidentStatus::Resolved => {
                incident.status = IncidentStatus::Resolved;
                incident.resolved_at = Some(now());
                incident.resolved_by = resolved_by;
                incident.resolution_notes = resolution_notes;
            }
            IncidentStatus::Investigating | IncidentStatus::Open => {
                incident.status = status;
            }
        }

        self.store.update(&incident).await?;
        info!(incident_id = id, %status, "updated incident status");

        Ok(Some(incident))
    }

    pub async fn get(&self, id: i64) -> Result<Option<Incident>, DetectError> {
        Ok(self.store.find_by_id(id).await?)
    }

    pub async fn list_all(&self) -> Result<Vec<Incident>, DetectError> {
        Ok(self.store.find_all().await?)
    }

    /// Incidents that still block dedup: OPEN and INVESTIGATING.
    pub async fn list_open(&self) -> Result<Vec<Incident>, DetectError> {
        Ok(self
            .store
            .find_by_status(&[IncidentStatus::Open, IncidentStatus::Investigating])
            .await?)
    }

    pub async fn list_by_status(&self, status: IncidentStatus) -> Result<Vec<Incident>, DetectError> {
        Ok(self.store.find_by_status(&[status]).await?)
    }

    pub async fn list_by_service(&self, service: &str) -> Result<Vec<Incident>, DetectError> {
        Ok(self.store.find_by_service(service).await?)
    }

    pub async fn list_by_type(&self, incident_type: IncidentType) -> Result<Vec<Incident>, DetectError> {
        Ok(self.store.find_by_type(incident_type).await?)
    }

    pub async fn stats(&self) -> Result<IncidentStats, DetectError> {
        Ok(self.store.stats().await?)
    }
}

/// Current time at the precision timestamps are stored with, so the values
/// handed back to callers match every later read.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::SqliteStore;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records every incident handed to it.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) sent: Mutex<Vec<Incident>>,
    }

    impl RecordingSink {
        pub(crate) fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl AlertSink for RecordingSink {
        fn send_alert(&self, incident: &Incident) {
            self.sent.lock().unwrap().push(incident.clone());
        }
    }

    fn manager() -> (TempDir, Arc<RecordingSink>, IncidentManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("incidents.db")).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let manager = IncidentManager::new(Arc::new(store), sink.clone());
        (dir, sink, manager)
    }

    fn request(service: &str, incident_type: IncidentType) -> IncidentRequest {
        IncidentRequest {
            incident_type,
            severity: Severity::High,
            service_name: service.into(),
            description: None,
            related_metrics: r#"{"memory_usage_percent":91.0,"threshold_percent":85.0}"#.into(),
        }
    }

    #[tokio::test]
    async fn test_create_populates_defaults_and_alerts() {
        let (_dir, sink, manager) = manager();
        let incident = manager
            .create_incident(request("checkout", IncidentType::ResourceExhaustion))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(incident.status, IncidentStatus::Open);
        assert_eq!(incident.description, "CPU or Memory usage critically high");
        assert_eq!(incident.probable_cause, "Memory leak in application");
        assert!(incident.resolved_at.is_none());
        assert_eq!(sink.count(), 1);
        assert_eq!(sink.sent.lock().unwrap()[0].id, incident.id);
    }

    #[tokio::test]
    async fn test_second_open_incident_is_suppressed() {
        let (_dir, sink, manager) = manager();
        manager
            .create_incident(request("checkout", IncidentType::PodRestart))
            .await
            .unwrap()
            .unwrap();

        let again = manager
            .create_incident(request("checkout", IncidentType::PodRestart))
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(manager.list_all().await.unwrap().len(), 1);
        assert_eq!(sink.count(), 1, "suppressed incidents are not alerted");
    }

    #[tokio::test]
    async fn test_investigating_still_blocks_and_resolved_does_not() {
        let (_dir, _sink, manager) = manager();
        let first = manager
            .create_incident(request("checkout", IncidentType::HighLatency))
            .await
            .unwrap()
            .unwrap();

        manager
            .update_status(first.id, "investigating", None, None)
            .await
            .unwrap()
            .unwrap();
        assert!(manager
            .create_incident(request("checkout", IncidentType::HighLatency))
            .await
            .unwrap()
            .is_none());

        manager
            .update_status(first.id, "RESOLVED", Some("oncall".into()), Some("rolled back".into()))
            .await
            .unwrap()
            .unwrap();
        let second = manager
            .create_incident(request("checkout", IncidentType::HighLatency))
            .await
            .unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn test_resolve_sets_resolution_fields() {
        let (_dir, _sink, manager) = manager();
        let created = manager
            .create_incident(request("payments", IncidentType::HighErrorRate))
            .await
            .unwrap()
            .unwrap();

        let resolved = manager
            .update_status(created.id, "RESOLVED", Some("alice".into()), Some("fixed pool size".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.status, IncidentStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("alice"));
        assert_eq!(resolved.resolution_notes.as_deref(), Some("fixed pool size"));
        assert!(resolved.resolved_at.is_some());
        assert_eq!(resolved.detected_at, created.detected_at);
        assert_eq!(resolved.severity, created.severity);

        assert!(manager.list_open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_returned_incidents_match_stored_rows() {
        let (_dir, _sink, manager) = manager();
        let created = manager
            .create_incident(request("payments", IncidentType::HighLatency))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manager.get(created.id).await.unwrap().unwrap(), created);

        let resolved = manager
            .update_status(created.id, "resolved", Some("alice".into()), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manager.get(created.id).await.unwrap().unwrap(), resolved);
    }

    #[tokio::test]
    async fn test_investigating_sets_status_only() {
        let (_dir, _sink, manager) = manager();
        let created = manager
            .create_incident(request("payments", IncidentType::HighErrorRate))
            .await
            .unwrap()
            .unwrap();

        let updated = manager
            .update_status(created.id, "INVESTIGATING", Some("ignored".into()), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, IncidentStatus::Investigating);
        assert!(updated.resolved_by.is_none());
        assert!(updated.resolved_at.is_none());
    }

    #[tokio::test]
    async fn test_bogus_status_is_rejected() {
        let (_dir, _sink, manager) = manager();
        let created = manager
            .create_incident(request("payments", IncidentType::HighErrorRate))
            .await
            .unwrap()
            .unwrap();

        let err = manager.update_status(created.id, "BOGUS", None, None).await.unwrap_err();
        assert!(matches!(err, DetectError::InvalidStatus(_)));
        assert_eq!(manager.get(created.id).await.unwrap().unwrap().status, IncidentStatus::Open);

        // Rejected even when the id does not exist.
        let err = manager.update_status(777, "BOGUS", None, None).await.unwrap_err();
        assert!(matches!(err, DetectError::InvalidStatus(_)));
    }

    #[tokio::test]
    async fn test_unknown_id_is_none() {
        let (_dir, _sink, manager) = manager();
        assert!(manager.update_status(777, "OPEN", None, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reopen_blocked_by_newer_open_incident() {
        let (_dir, _sink, manager) = manager();
        let first = manager
            .create_incident(request("checkout", IncidentType::PodRestart))
            .await
            .unwrap()
            .unwrap();
        manager.update_status(first.id, "RESOLVED", None, None).await.unwrap();
        manager
            .create_incident(request("checkout", IncidentType::PodRestart))
            .await
            .unwrap()
            .unwrap();

        let err = manager.update_status(first.id, "OPEN", None, None).await.unwrap_err();
        assert!(matches!(err, DetectError::DuplicateOpenIncident { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_creates_yield_one_incident() {
        let (_dir, sink, manager) = manager();
        let manager = Arc::new(manager);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .create_incident(request("checkout", IncidentType::ResourceExhaustion))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut created = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(manager.list_by_type(IncidentType::ResourceExhaustion).await.unwrap().len(), 1);
        assert_eq!(sink.count(), 1);
    }

    #[tokio::test]
    async fn test_read_projections_and_stats() {
        let (_dir, _sink, manager) = manager();
        let a = manager
            .create_incident(IncidentRequest {
                severity: Severity::Critical,
                ..request("checkout", IncidentType::PodRestart)
            })
            .await
            .unwrap()
            .unwrap();
        manager
            .create_incident(request("payments", IncidentType::HighLatency))
            .await
            .unwrap()
            .unwrap();
        manager.update_status(a.id, "RESOLVED", None, None).await.unwrap();

        assert_eq!(manager.list_by_service("checkout").await.unwrap().len(), 1);
        assert_eq!(manager.list_by_status(IncidentStatus::Resolved).await.unwrap().len(), 1);
        assert_eq!(manager.list_open().await.unwrap().len(), 1);

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.open, 1);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.critical_open, 0);
        assert_eq!(stats.high_open, 1);
    }
}
