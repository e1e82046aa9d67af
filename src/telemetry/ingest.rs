//! Validation and conversion of inbound metric and log payloads.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::telemetry::{LogEntry, LogLevel, Metric};

#[derive(Debug, Error, PartialEq)]
pub enum IngestError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("metric value must be a finite number")]
    NonFiniteValue,

    #[error("{0}")]
    InvalidLevel(String),
}

/// Inbound metric. A missing timestamp means "now".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricInput {
    pub timestamp: Option<DateTime<Utc>>,
    pub metric_name: Option<String>,
    pub value: Option<f64>,
    pub service_name: Option<String>,
    pub pod_name: Option<String>,
    pub namespace: Option<String>,
    pub unit: Option<String>,
}

impl MetricInput {
    pub fn into_metric(self, now: DateTime<Utc>) -> Result<Metric, IngestError> {
        let metric_name = required(self.metric_name, "metricName")?;
        let service_name = required(self.service_name, "serviceName")?;
        let value = self.value.ok_or(IngestError::MissingField("value"))?;
        if !value.is_finite() {
            return Err(IngestError::NonFiniteValue);
        }

        Ok(Metric {
            timestamp: self.timestamp.unwrap_or(now),
            metric_name,
            value,
            service_name,
            pod_name: self.pod_name,
            namespace: self.namespace,
            unit: self.unit,
        })
    }
}

/// Inbound log entry. Level defaults to INFO and is matched case-insensitively.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogInput {
    pub timestamp: Option<DateTime<Utc>>,
    pub level: Option<String>,
    pub message: Option<String>,
    pub service_name: Option<String>,
    pub pod_name: Option<String>,
    pub namespace: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl LogInput {
    pub fn into_entry(self, now: DateTime<Utc>) -> Result<LogEntry, IngestError> {
        let message = required(self.message, "message")?;
        let service_name = required(self.service_name, "serviceName")?;
        let level = match self.level.as_deref() {
            None => LogLevel::Info,
            Some(raw) => raw.parse().map_err(IngestError::InvalidLevel)?,
        };

        Ok(LogEntry {
            timestamp: self.timestamp.unwrap_or(now),
            level,
            message,
            service_name,
            pod_name: self.pod_name,
            namespace: self.namespace,
            trace_id: self.trace_id,
            span_id: self.span_id,
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, IngestError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(IngestError::MissingField(field)),
    }
}

/// Convert a batch, failing on the first invalid item.
pub fn metrics_from_inputs(inputs: Vec<MetricInput>, now: DateTime<Utc>) -> Result<Vec<Metric>, IngestError> {
    inputs.into_iter().map(|i| i.into_metric(now)).collect()
}

pub fn logs_from_inputs(inputs: Vec<LogInput>, now: DateTime<Utc>) -> Result<Vec<LogEntry>, IngestError> {
    inputs.into_iter().map(|i| i.into_entry(now)).collect()
}
