//! Keyword heuristic that picks a probable cause for an incident.

use crate::detect::IncidentType;

/// Returned when no candidate list exists for an incident type.
pub const UNKNOWN_CAUSE: &str = "Unknown - requires manual investigation";

const MEMORY_KEYWORDS: &[&str] = &["memory", "Memory", "OOM"];
const CPU_KEYWORDS: &[&str] = &["CPU", "cpu", "throttl"];
const DATABASE_KEYWORDS: &[&str] = &["Database", "database", "connection"];
const TIMEOUT_KEYWORDS: &[&str] = &["timeout", "Timeout"];
const CONNECTION_KEYWORDS: &[&str] = &["connection", "Connection"];

/// Candidate causes for an incident type, most likely first.
pub fn possible_causes(incident_type: IncidentType) -> &'static [&'static str] {
    match incident_type {
        IncidentType::HighErrorRate => &[
            "Database connection pool exhausted",
            "Downstream service unavailable",
            "Invalid request parameters from client",
            "Authentication/Authorization failures",
            "Network connectivity issues",
        ],
        IncidentType::HighLatency => &[
            "Database slow queries",
            "External API timeout",
            "Network congestion",
            "Insufficient resources (CPU throttling)",
            "Lock contention in database",
        ],
        IncidentType::ResourceExhaustion => &[
            "Memory leak in application",
            "Resource limits set too low",
            "Traffic spike exceeding capacity",
            "Inefficient garbage collection",
            "Connection pool leak",
        ],
        IncidentType::PodRestart => &[
            "OOMKilled - Out of memory",
            "CrashLoopBackOff - Application crash",
            "Liveness probe failure",
            "Readiness probe failure",
            "Node pressure eviction",
        ],
    }
}

/// Pick the most probable cause for an incident from its type and context.
///
/// Signals are checked in a fixed priority order: memory and cpu tokens in
/// `related_metrics` (only when some candidate mentions them), database
/// tokens in `related_metrics`, then `timeout` and `connection` in the
/// description. With no signal the first candidate wins.
pub fn analyze_cause(incident_type: IncidentType, related_metrics: &str, description: &str) -> String {
    select(possible_causes(incident_type), related_metrics, description).to_string()
}

fn select(causes: &'static [&'static str], related_metrics: &str, description: &str) -> &'static str {
    let Some(&default) = causes.first() else {
        return UNKNOWN_CAUSE;
    };

    if related_metrics.contains("memory") {
        if let Some(cause) = find_containing(causes, MEMORY_KEYWORDS) {
            return cause;
        }
    }
    if related_metrics.contains("cpu") {
        if let Some(cause) = find_containing(causes, CPU_KEYWORDS) {
            return cause;
        }
    }
    if related_metrics.contains("database") || related_metrics.contains("db") {
        return find_containing(causes, DATABASE_KEYWORDS).unwrap_or(default);
    }

    let description = description.to_lowercase();
    if description.contains("timeout") {
        return find_containing(causes, TIMEOUT_KEYWORDS).unwrap_or(default);
    }
    if description.contains("connection") {
        return find_containing(causes, CONNECTION_KEYWORDS).unwrap_or(default);
    }

    default
}

fn find_containing(causes: &'static [&'static str], keywords: &[&str]) -> Option<&'static str> {
    causes
        .iter()
        .copied()
        .find(|cause| keywords.iter().any(|kw| cause.contains(kw)))
}
