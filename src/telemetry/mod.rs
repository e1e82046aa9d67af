//! Metric and log records collected from services and pods.

pub mod ingest;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known metric names read by the detection rules.
pub mod names {
    pub const HTTP_5XX_COUNT: &str = "http_5xx_count";
    pub const HTTP_TOTAL_COUNT: &str = "http_total_count";
    pub const LATENCY_MS: &str = "latency_ms";
    pub const CPU_USAGE_PERCENT: &str = "cpu_usage_percent";
    pub const MEMORY_USAGE_PERCENT: &str = "memory_usage_percent";
    pub const POD_RESTART_COUNT: &str = "pod_restart_count";
}

/// A single metric sample. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub value: f64,
    pub service_name: String,
    pub pod_name: Option<String>,
    pub namespace: Option<String>,
    pub unit: Option<String>,
}

impl Metric {
    pub fn new(metric_name: impl Into<String>, value: f64, service_name: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            metric_name: metric_name.into(),
            value,
            service_name: service_name.into(),
            pod_name: None,
            namespace: None,
            unit: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            _ => Err(format!("unknown log level '{}'", s)),
        }
    }
}

/// A log line emitted by a service. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub service_name: String,
    pub pod_name: Option<String>,
    pub namespace: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            service_name: service_name.into(),
            pod_name: None,
            namespace: None,
            trace_id: None,
            span_id: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
