use std::sync::Arc;

use crate::alert::WebhookDispatcher;
use crate::detect::incident::IncidentManager;
use crate::scheduler::DetectionScheduler;
use crate::storage::TimeSeriesStore;

#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<dyn TimeSeriesStore>,
    pub incidents: Arc<IncidentManager>,
    pub scheduler: DetectionScheduler,
    pub alerts: Arc<WebhookDispatcher>,
}
