//! incidentbot -- metric and log driven incident detection for services.
//!
//! This crate provides the core library for telemetry ingestion, rule-based
//! anomaly detection, incident lifecycle management, webhook alerting and
//! the HTTP API that exposes them.

pub mod alert;
pub mod api;
pub mod config;
pub mod detect;
pub mod scheduler;
pub mod storage;
pub mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::alert::WebhookDispatcher;
use crate::config::AppConfig;
use crate::detect::engine::RuleEvaluator;
use crate::detect::incident::IncidentManager;
use crate::scheduler::DetectionScheduler;
use crate::storage::SqliteStore;

/// Fully wired service components sharing one database.
#[derive(Clone)]
pub struct Components {
    pub store: Arc<SqliteStore>,
    pub alerts: Arc<WebhookDispatcher>,
    pub incidents: Arc<IncidentManager>,
    pub scheduler: DetectionScheduler,
}

impl Components {
    /// Open storage and build the detection pipeline from `config`.
    pub fn build(config: &AppConfig) -> Result<Self> {
        let db_path = &config.storage.db_path;
        tracing::info!(db_path = %db_path.display(), "initializing database");
        let store = Arc::new(SqliteStore::open(db_path)?);

        let alerts = Arc::new(WebhookDispatcher::new(config.alerting.clone())?);
        let incidents = Arc::new(IncidentManager::new(store.clone(), alerts.clone()));
        let evaluator = Arc::new(RuleEvaluator::new(
            store.clone(),
            incidents.clone(),
            config.detection.clone(),
        ));
        let scheduler = DetectionScheduler::new(evaluator, &config.detection);

        Ok(Self {
            store,
            alerts,
            incidents,
            scheduler,
        })
    }

    pub fn app_state(&self) -> api::state::AppState {
        api::state::AppState {
            metrics: self.store.clone(),
            incidents: self.incidents.clone(),
            scheduler: self.scheduler.clone(),
            alerts: self.alerts.clone(),
        }
    }
}

/// Start the daemon: API server plus the periodic detection loop.
pub async fn serve(config: AppConfig) -> Result<()> {
    let components = Components::build(&config)?;

    let scheduler = components.scheduler.clone();
    tokio::spawn(async move {
        scheduler::run_detection_loop(scheduler).await;
    });

    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.server.bind))?;
    let app = api::router(components.app_state());

    tracing::info!(%addr, "incidentbot listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
