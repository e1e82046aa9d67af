use crate::scheduler::DetectionScheduler;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Main detection loop. Never returns.
///
/// Each tick starts a pass on its own task. A tick that arrives while the
/// previous pass is still running is skipped, and a pass that fails or
/// panics only affects itself.
pub async fn run_detection_loop(scheduler: DetectionScheduler) {
    info!(interval_secs = scheduler.interval().as_secs(), "detection scheduler started");

    let mut interval = tokio::time::interval(scheduler.interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        debug!("scheduled anomaly detection triggered");
        spawn_scheduled_pass(&scheduler);
    }
}

/// Start one scheduled pass in the background, or return `None` when the
/// previous pass still holds the slot.
pub fn spawn_scheduled_pass(scheduler: &DetectionScheduler) -> Option<JoinHandle<()>> {
    let Some(guard) = scheduler.try_begin_pass() else {
        warn!("previous detection pass still running, skipping tick");
        return None;
    };

    let scheduler = scheduler.clone();
    Some(tokio::spawn(async move {
        let _guard = guard;
        match scheduler.run_pass().await {
            Ok(summary) => {
                if summary.incidents_created > 0 {
                    info!(
                        services = summary.services,
                        incidents_created = summary.incidents_created,
                        "detection pass opened incidents"
                    );
                }
            }
            Err(e) => {
                error!(error = %e, "error during scheduled anomaly detection");
            }
        }
    }))
}
