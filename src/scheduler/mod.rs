//! Periodic and on-demand detection passes.

pub mod engine;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::DetectionConfig;
use crate::detect::engine::RuleEvaluator;

pub use self::engine::{run_detection_loop, spawn_scheduled_pass};

/// Outcome of one detection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassSummary {
    pub services: usize,
    pub incidents_created: usize,
}

/// Drives the rule evaluator over every known service.
#[derive(Clone)]
pub struct DetectionScheduler {
    evaluator: Arc<RuleEvaluator>,
    /// True while a scheduled pass is in flight.
    running: Arc<AtomicBool>,
    interval: Duration,
    max_concurrent_services: usize,
}

impl DetectionScheduler {
    pub fn new(evaluator: Arc<RuleEvaluator>, config: &DetectionConfig) -> Self {
        Self {
            evaluator,
            running: Arc::new(AtomicBool::new(false)),
            interval: config.check_interval(),
            max_concurrent_services: config.max_concurrent_services.max(1),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim the single scheduled-pass slot, or `None` if a pass is still running.
    pub fn try_begin_pass(&self) -> Option<PassGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard {
                flag: self.running.clone(),
            })
    }

    /// Evaluate every service that has reported metrics.
    pub async fn run_pass(&self) -> Result<PassSummary> {
        debug!("running anomaly detection");
        let services = self
            .evaluator
            .metrics()
            .distinct_service_names()
            .await
            .context("failed to list services")?;

        let service_count = services.len();
        let created: Vec<usize> = stream::iter(services)
            .map(|service| {
                let evaluator = self.evaluator.clone();
                async move { evaluator.evaluate_service(&service).await.len() }
            })
            .buffer_unordered(self.max_concurrent_services)
            .collect()
            .await;

        let summary = PassSummary {
            services: service_count,
            incidents_created: created.into_iter().sum(),
        };
        debug!(
            services = summary.services,
            incidents_created = summary.incidents_created,
            "anomaly detection completed"
        );
        Ok(summary)
    }

    /// Run one pass immediately, outside the timer, and surface any failure.
    ///
    /// Manual passes do not take the scheduled-pass slot; dedup keeps a
    /// concurrent scheduled pass from opening duplicates.
    pub async fn trigger_now(&self) -> Result<PassSummary> {
        info!("manual detection pass triggered");
        self.run_pass().await
    }
}

/// Releases the scheduled-pass slot when dropped, including on panic.
pub struct PassGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::engine::tests::{evaluator, StubMetrics};
    use crate::telemetry::names::CPU_USAGE_PERCENT;
    use std::collections::HashMap;

    fn scheduler(stub: StubMetrics) -> (tempfile::TempDir, DetectionScheduler) {
        let (dir, _sink, _manager, evaluator) = evaluator(stub);
        (dir, DetectionScheduler::new(Arc::new(evaluator), &DetectionConfig::default()))
    }

    #[test]
    fn test_guard_is_exclusive_and_released_on_drop() {
        let (_dir, scheduler) = scheduler(StubMetrics::default());
        assert!(!scheduler.is_running());

        let guard = scheduler.try_begin_pass().unwrap();
        assert!(scheduler.is_running());
        assert!(scheduler.try_begin_pass().is_none());

        drop(guard);
        assert!(!scheduler.is_running());
        assert!(scheduler.try_begin_pass().is_some());
    }

    #[tokio::test]
    async fn test_pass_covers_every_service() {
        let (_dir, scheduler) = scheduler(StubMetrics {
            averages: HashMap::from([(CPU_USAGE_PERCENT, 95.0)]),
            services: vec!["checkout".into(), "payments".into(), "search".into()],
            ..Default::default()
        });

        let summary = scheduler.trigger_now().await.unwrap();
        assert_eq!(
            summary,
            PassSummary {
                services: 3,
                incidents_created: 3
            }
        );

        let again = scheduler.trigger_now().await.unwrap();
        assert_eq!(again.incidents_created, 0);
    }

    #[tokio::test]
    async fn test_pass_runs_on_spawned_task() {
        let (_dir, scheduler) = scheduler(StubMetrics {
            averages: HashMap::from([(CPU_USAGE_PERCENT, 95.0)]),
            services: vec!["checkout".into(), "payments".into()],
            ..Default::default()
        });

        let background = scheduler.clone();
        let summary = tokio::spawn(async move { background.run_pass().await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.services, 2);
        assert_eq!(summary.incidents_created, 2);

        let manual = scheduler.clone();
        let again = tokio::spawn(async move { manual.trigger_now().await }).await.unwrap().unwrap();
        assert_eq!(again.incidents_created, 0);
    }

    #[tokio::test]
    async fn test_manual_trigger_surfaces_errors() {
        let (_dir, scheduler) = scheduler(StubMetrics {
            fail_listing: true,
            ..Default::default()
        });
        let err = scheduler.trigger_now().await.unwrap_err();
        assert!(err.to_string().contains("failed to list services"));
    }

    #[tokio::test]
    async fn test_manual_trigger_ignores_scheduled_guard() {
        let (_dir, scheduler) = scheduler(StubMetrics {
            services: vec!["checkout".into()],
            ..Default::default()
        });
        let _guard = scheduler.try_begin_pass().unwrap();
        assert_eq!(scheduler.trigger_now().await.unwrap().services, 1);
    }
}
