use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::DetectionConfig;
use crate::detect::incident::{IncidentManager, IncidentRequest};
use crate::detect::{Incident, IncidentType, Severity};
use crate::storage::{StoreError, TimeSeriesStore};
use crate::telemetry::names::{
    CPU_USAGE_PERCENT, HTTP_5XX_COUNT, HTTP_TOTAL_COUNT, LATENCY_MS, MEMORY_USAGE_PERCENT, POD_RESTART_COUNT,
};
use crate::telemetry::LogLevel;

/// ERROR log lines within the error-log window that open an incident.
pub const ERROR_LOG_LIMIT: u64 = 50;

const CRITICAL_ERROR_RATE_PERCENT: f64 = 20.0;
const CRITICAL_MEMORY_PERCENT: f64 = 95.0;

/// The threshold checks run against every service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    ErrorRate,
    ErrorLogVolume,
    Latency,
    Cpu,
    Memory,
    PodRestarts,
}

impl Rule {
    pub const ALL: [Rule; 6] = [
        Rule::ErrorRate,
        Rule::ErrorLogVolume,
        Rule::Latency,
        Rule::Cpu,
        Rule::Memory,
        Rule::PodRestarts,
    ];

    /// How far back from "now" the rule looks.
    pub fn window(self) -> Duration {
        match self {
            Rule::ErrorRate | Rule::ErrorLogVolume | Rule::Latency => Duration::minutes(5),
            Rule::Cpu | Rule::Memory => Duration::minutes(3),
            Rule::PodRestarts => Duration::minutes(10),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Rule::ErrorRate => "error_rate",
            Rule::ErrorLogVolume => "error_log_volume",
            Rule::Latency => "latency",
            Rule::Cpu => "cpu",
            Rule::Memory => "memory",
            Rule::PodRestarts => "pod_restarts",
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A threshold breach found by one rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub incident_type: IncidentType,
    pub severity: Severity,
    pub description: String,
    /// Raw values and thresholds that triggered the breach.
    pub related_metrics: Value,
}

impl Breach {
    fn into_request(self, service: &str) -> IncidentRequest {
        IncidentRequest {
            incident_type: self.incident_type,
            severity: self.severity,
            service_name: service.to_string(),
            description: Some(self.description),
            related_metrics: self.related_metrics.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Breach decisions
// ---------------------------------------------------------------------------

pub fn assess_error_rate(errors: Option<f64>, total: Option<f64>, threshold: f64) -> Option<Breach> {
    let (errors, total) = (errors?, total?);
    if total <= 0.0 {
        return None;
    }
    let rate = errors / total * 100.0;
    if rate <= threshold {
        return None;
    }

    Some(Breach {
        incident_type: IncidentType::HighErrorRate,
        severity: if rate > CRITICAL_ERROR_RATE_PERCENT {
            Severity::Critical
        } else {
            Severity::High
        },
        description: format!("HTTP 5xx error rate is {:.2}% (threshold: {:.2}%)", rate, threshold),
        related_metrics: json!({
            "http_5xx_count": errors,
            "http_total_count": total,
            "error_rate_percent": rate,
        }),
    })
}

pub fn assess_error_logs(count: u64) -> Option<Breach> {
    if count <= ERROR_LOG_LIMIT {
        return None;
    }
    Some(Breach {
        incident_type: IncidentType::HighErrorRate,
        severity: Severity::Medium,
        description: format!("High error log volume: {} errors in last 5 minutes", count),
        related_metrics: json!({ "error_log_count": count }),
    })
}

pub fn assess_latency(avg: Option<f64>, threshold: f64) -> Option<Breach> {
    let avg = avg.filter(|v| *v > threshold)?;
    Some(Breach {
        incident_type: IncidentType::HighLatency,
        severity: if avg > threshold * 2.0 {
            Severity::High
        } else {
            Severity::Medium
        },
        description: format!("Average latency is {:.2} ms (threshold: {:.2} ms)", avg, threshold),
        related_metrics: json!({ "avg_latency_ms": avg, "threshold_ms": threshold }),
    })
}

pub fn assess_cpu(avg: Option<f64>, threshold: f64) -> Option<Breach> {
    let avg = avg.filter(|v| *v > threshold)?;
    Some(Breach {
        incident_type: IncidentType::ResourceExhaustion,
        severity: Severity::High,
        description: format!("CPU usage is {:.2}% (threshold: {:.2}%)", avg, threshold),
        related_metrics: json!({ "cpu_usage_percent": avg, "threshold_percent": threshold }),
    })
}

pub fn assess_memory(avg: Option<f64>, threshold: f64) -> Option<Breach> {
    let avg = avg.filter(|v| *v > threshold)?;
    Some(Breach {
        incident_type: IncidentType::ResourceExhaustion,
        severity: if avg > CRITICAL_MEMORY_PERCENT {
            Severity::Critical
        } else {
            Severity::High
        },
        description: format!("Memory usage is {:.2}% (threshold: {:.2}%)", avg, threshold),
        related_metrics: json!({ "memory_usage_percent": avg, "threshold_percent": threshold }),
    })
}

/// Restarts are summed over the window, not averaged.
pub fn assess_pod_restarts(sum: Option<f64>, threshold: u32) -> Option<Breach> {
    let sum = sum.filter(|v| *v >= f64::from(threshold))?;
    Some(Breach {
        incident_type: IncidentType::PodRestart,
        severity: Severity::Critical,
        description: format!("{:.0} pod restarts in last 10 minutes (threshold: {})", sum, threshold),
        related_metrics: json!({
            "restart_count": sum,
            "threshold": threshold,
            "period_minutes": Rule::PodRestarts.window().num_minutes(),
        }),
    })
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Runs every rule for one service and opens incidents for the breaches.
pub struct RuleEvaluator {
    metrics: Arc<dyn TimeSeriesStore>,
    incidents: Arc<IncidentManager>,
    config: DetectionConfig,
}

impl RuleEvaluator {
    pub fn new(metrics: Arc<dyn TimeSeriesStore>, incidents: Arc<IncidentManager>, config: DetectionConfig) -> Self {
        Self {
            metrics,
            incidents,
            config,
        }
    }

    pub fn metrics(&self) -> &Arc<dyn TimeSeriesStore> {
        &self.metrics
    }

    /// Evaluate all rules for `service` and return the incidents opened.
    ///
    /// A failing rule is logged and skipped; it never stops the others.
    pub async fn evaluate_service(&self, service: &str) -> Vec<Incident> {
        let now = Utc::now();
        let mut created = Vec::new();

        for rule in Rule::ALL {
            let breach = match self.check(rule, service, now).await {
                Ok(Some(breach)) => breach,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%service, %rule, error = %e, "rule check failed, skipping");
                    continue;
                }
            };

            info!(%service, %rule, severity = %breach.severity, "{}", breach.description);

            match self.incidents.create_incident(breach.into_request(service)).await {
                Ok(Some(incident)) => created.push(incident),
                Ok(None) => {}
                Err(e) => warn!(%service, %rule, error = %e, "failed to open incident"),
            }
        }

        created
    }

    async fn check(&self, rule: Rule, service: &str, now: DateTime<Utc>) -> Result<Option<Breach>, StoreError> {
        let since = now - rule.window();
        let metrics = &self.metrics;
        let cfg = &self.config;

        let breach = match rule {
            Rule::ErrorRate => {
                let errors = metrics.window_average(HTTP_5XX_COUNT, service, since).await?;
                let total = metrics.window_average(HTTP_TOTAL_COUNT, service, since).await?;
                assess_error_rate(errors, total, cfg.error_rate_threshold)
            }
            Rule::ErrorLogVolume => {
                let count = metrics.count_logs_by_level(service, LogLevel::Error, since).await?;
                assess_error_logs(count)
            }
            Rule::Latency => {
                let avg = metrics.window_average(LATENCY_MS, service, since).await?;
                assess_latency(avg, cfg.latency_threshold_ms)
            }
            Rule::Cpu => {
                let avg = metrics.window_average(CPU_USAGE_PERCENT, service, since).await?;
                assess_cpu(avg, cfg.cpu_threshold_percent)
            }
            Rule::Memory => {
                let avg = metrics.window_average(MEMORY_USAGE_PERCENT, service, since).await?;
                assess_memory(avg, cfg.memory_threshold_percent)
            }
            Rule::PodRestarts => {
                let sum = metrics.window_sum(POD_RESTART_COUNT, service, since).await?;
                assess_pod_restarts(sum, cfg.pod_restart_threshold)
            }
        };

        Ok(breach)
    }
}
