//! Anomaly detection rules and incident lifecycle.

pub mod cause;
pub mod engine;
pub mod incident;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("invalid status '{0}': use OPEN, INVESTIGATING, or RESOLVED")]
    InvalidStatus(String),

    #[error("an open {incident_type} incident already exists for service '{service}'")]
    DuplicateOpenIncident {
        service: String,
        incident_type: IncidentType,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for DetectError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateOpenIncident {
                service,
                incident_type,
            } => DetectError::DuplicateOpenIncident {
                service,
                incident_type,
            },
            other => DetectError::Store(other),
        }
    }
}

/// Kind of operational anomaly an incident describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentType {
    HighErrorRate,
    HighLatency,
    ResourceExhaustion,
    PodRestart,
}

impl IncidentType {
    pub const ALL: [IncidentType; 4] = [
        IncidentType::HighErrorRate,
        IncidentType::HighLatency,
        IncidentType::ResourceExhaustion,
        IncidentType::PodRestart,
    ];

    /// Canonical description, used when a rule supplies none.
    pub fn description(self) -> &'static str {
        match self {
            IncidentType::HighErrorRate => "High rate of HTTP 5xx errors",
            IncidentType::HighLatency => "Response latency exceeds threshold",
            IncidentType::ResourceExhaustion => "CPU or Memory usage critically high",
            IncidentType::PodRestart => "Frequent pod restarts detected",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IncidentType::HighErrorRate => "HIGH_ERROR_RATE",
            IncidentType::HighLatency => "HIGH_LATENCY",
            IncidentType::ResourceExhaustion => "RESOURCE_EXHAUSTION",
            IncidentType::PodRestart => "POD_RESTART",
        }
    }
}

impl fmt::Display for IncidentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IncidentType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown incident type '{}'", s))
    }
}

/// Severity levels for detected incidents, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity '{}'", s)),
        }
    }
}

/// Incident lifecycle: OPEN -> INVESTIGATING -> RESOLVED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    Open,
    Investigating,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentStatus::Open => "OPEN",
            IncidentStatus::Investigating => "INVESTIGATING",
            IncidentStatus::Resolved => "RESOLVED",
        }
    }

    /// OPEN and INVESTIGATING both block a new incident for the same service and type.
    pub fn is_open(self) -> bool {
        !matches!(self, IncidentStatus::Resolved)
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentStatus {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Ok(IncidentStatus::Open),
            "INVESTIGATING" => Ok(IncidentStatus::Investigating),
            "RESOLVED" => Ok(IncidentStatus::Resolved),
            _ => Err(DetectError::InvalidStatus(s.to_string())),
        }
    }
}

/// A detected incident as persisted by the incident store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: i64,
    #[serde(rename = "type")]
    pub incident_type: IncidentType,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub detected_at: DateTime<Utc>,
    pub probable_cause: String,
    pub description: String,
    pub service_name: String,
    /// JSON snapshot of the values that triggered the incident.
    pub related_metrics: String,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
}

/// An incident that has been built but not yet assigned an id.
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub incident_type: IncidentType,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    pub probable_cause: String,
    pub description: String,
    pub service_name: String,
    pub related_metrics: String,
}

impl NewIncident {
    pub fn into_incident(self, id: i64) -> Incident {
        Incident {
            id,
            incident_type: self.incident_type,
            severity: self.severity,
            status: IncidentStatus::Open,
            detected_at: self.detected_at,
            probable_cause: self.probable_cause,
            description: self.description,
            service_name: self.service_name,
            related_metrics: self.related_metrics,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
        }
    }
}

/// Incident counts per status, plus urgent open incidents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentStats {
    pub open: u64,
    pub investigating: u64,
    pub resolved: u64,
    pub critical_open: u64,
    pub high_open: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_status_parse_is_case_insensitive() {
        assert_eq!(
            "investigating".parse::<IncidentStatus>().unwrap(),
            IncidentStatus::Investigating
        );
        assert_eq!(" Resolved ".parse::<IncidentStatus>().unwrap(), IncidentStatus::Resolved);
    }

    #[test]
    fn test_status_parse_rejects_unknown() {
        let err = "BOGUS".parse::<IncidentStatus>().unwrap_err();
        assert!(matches!(err, DetectError::InvalidStatus(ref s) if s == "BOGUS"));
    }

    #[test]
    fn test_only_resolved_is_terminal() {
        assert!(IncidentStatus::Open.is_open());
        assert!(IncidentStatus::Investigating.is_open());
        assert!(!IncidentStatus::Resolved.is_open());
    }

    #[test]
    fn test_incident_type_serializes_screaming_snake() {
        let json = serde_json::to_string(&IncidentType::ResourceExhaustion).unwrap();
        assert_eq!(json, "\"RESOURCE_EXHAUSTION\"");
        assert_eq!(
            "pod_restart".parse::<IncidentType>().unwrap(),
            IncidentType::PodRestart
        );
    }
}
