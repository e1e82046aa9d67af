//! TOML configuration for incidentbot.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working setup with alerting effectively off until a webhook
//! URL is configured.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "INCIDENTBOT_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/incidentbot/incidentbot.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub alerting: AlertingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. An explicit path (from `--config`), which must load.
    /// 2. The path in `INCIDENTBOT_CONFIG`.
    /// 3. `/etc/incidentbot/incidentbot.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "INCIDENTBOT_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Server / storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP API listens on.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file; parent directories are created on open.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/incidentbot.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Detection interval and rule thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Seconds between scheduled detection passes.
    pub check_interval_secs: u64,
    /// HTTP 5xx share of all requests, in percent.
    pub error_rate_threshold: f64,
    /// Mean latency in milliseconds.
    pub latency_threshold_ms: f64,
    pub cpu_threshold_percent: f64,
    pub memory_threshold_percent: f64,
    /// Restarts within the pod-restart window that open an incident.
    pub pod_restart_threshold: u32,
    /// Services evaluated in parallel during one pass.
    pub max_concurrent_services: usize,
}

impl DetectionConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            error_rate_threshold: 5.0,
            latency_threshold_ms: 2000.0,
            cpu_threshold_percent: 90.0,
            memory_threshold_percent: 85.0,
            pod_restart_threshold: 3,
            max_concurrent_services: 4,
        }
    }
}

// ---------------------------------------------------------------------------
// Alerting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Global switch; when false no alert is ever sent for new incidents.
    pub enabled: bool,
    /// Endpoint receiving JSON alert payloads via POST.
    pub webhook_url: Option<String>,
    /// Base URL of a dashboard; alerts link to `<dashboard_url>/incidents/<id>`.
    pub dashboard_url: Option<String>,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: None,
            dashboard_url: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit newline-delimited JSON instead of human-readable lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert_eq!(cfg.storage.db_path, PathBuf::from("data/incidentbot.db"));

        assert_eq!(cfg.detection.check_interval(), Duration::from_secs(30));
        assert_eq!(cfg.detection.error_rate_threshold, 5.0);
        assert_eq!(cfg.detection.latency_threshold_ms, 2000.0);
        assert_eq!(cfg.detection.cpu_threshold_percent, 90.0);
        assert_eq!(cfg.detection.memory_threshold_percent, 85.0);
        assert_eq!(cfg.detection.pod_restart_threshold, 3);

        assert!(cfg.alerting.enabled);
        assert!(cfg.alerting.webhook_url.is_none());
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[server]
bind = "127.0.0.1:9090"

[detection]
check_interval_secs = 10
latency_threshold_ms = 750.0
pod_restart_threshold = 5

[alerting]
enabled = false
webhook_url = "https://hooks.example.com/incidents"

[logging]
json = true
"#;
        let cfg: AppConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.server.bind, "127.0.0.1:9090");
        assert_eq!(cfg.detection.check_interval_secs, 10);
        assert_eq!(cfg.detection.latency_threshold_ms, 750.0);
        assert_eq!(cfg.detection.pod_restart_threshold, 5);
        // Unspecified keys keep their defaults.
        assert_eq!(cfg.detection.cpu_threshold_percent, 90.0);
        assert!(!cfg.alerting.enabled);
        assert_eq!(
            cfg.alerting.webhook_url.as_deref(),
            Some("https://hooks.example.com/incidents")
        );
        assert!(cfg.logging.json);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let cfg = DetectionConfig {
            check_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(cfg.check_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incidentbot.toml");
        std::fs::write(&path, "[storage]\ndb_path = \"/tmp/x.db\"\n").unwrap();

        let cfg = AppConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.storage.db_path, PathBuf::from("/tmp/x.db"));

        assert!(AppConfig::resolve(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
