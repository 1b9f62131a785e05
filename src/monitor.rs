//! Background tasks
//!
//! Rollback monitor, queue/backup maintenance and the analyzer poll. Each
//! loop ticks on its own interval and exits once the shutdown channel flips
//! to `true`.

use crate::controller::{Controller, ProposeOutcome};
use crate::proposal::SignalSource;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Handles of the spawned loops
pub struct BackgroundTasks {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every loop to observe shutdown
    pub async fn join(self) {
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!("{} task ended abnormally: {}", name, e);
            }
        }
    }
}

/// Spawn every loop the controller needs. The analyzer poll only runs when a
/// signal source is configured.
pub fn spawn_background_tasks(
    controller: Arc<Controller>,
    source: Option<Arc<dyn SignalSource>>,
    shutdown: watch::Receiver<bool>,
) -> BackgroundTasks {
    let schedule = controller.config().schedule.clone();
    let mut handles = Vec::new();

    let c = controller.clone();
    handles.push(spawn_loop(
        "rollback monitor",
        Duration::from_secs(schedule.rollback_check_interval_secs),
        shutdown.clone(),
        move || {
            let c = c.clone();
            async move { rollback_pass(&c).await }
        },
    ));

    let c = controller.clone();
    handles.push(spawn_loop(
        "expiry sweep",
        Duration::from_secs(schedule.expiry_sweep_interval_secs),
        shutdown.clone(),
        move || {
            let c = c.clone();
            async move { expiry_pass(&c).await }
        },
    ));

    let c = controller.clone();
    handles.push(spawn_loop(
        "backup retention",
        Duration::from_secs(schedule.retention_sweep_interval_secs),
        shutdown.clone(),
        move || {
            let c = c.clone();
            async move { retention_pass(&c).await }
        },
    ));

    match source {
        Some(source) => {
            let c = controller;
            handles.push(spawn_loop(
                "analyzer poll",
                Duration::from_secs(schedule.analysis_interval_minutes * 60),
                shutdown,
                move || {
                    let c = c.clone();
                    let source = source.clone();
                    async move {
                        analyzer_pass(&c, source).await;
                    }
                },
            ));
        }
        None => info!("No signal source configured, analyzer poll disabled"),
    }

    BackgroundTasks { handles }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> (&'static str, JoinHandle<()>)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await; // First tick completes immediately, skip it
        info!("{} task started (every {:?})", name, period);

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("{} task stopped", name);
    });
    (name, handle)
}

pub async fn rollback_pass(controller: &Controller) {
    let report = controller.rollback_overdue().await;
    if !report.rolled_back.is_empty() {
        info!("Rolled back {} overdue updates", report.rolled_back.len());
    }
    if !report.failed.is_empty() {
        error!(
            "{} overdue updates could not be rolled back: {:?}",
            report.failed.len(),
            report.failed
        );
    }
}

pub async fn expiry_pass(controller: &Controller) {
    let expired = controller.sweep_expired().await;
    if expired > 0 {
        info!("Expired {} pending proposals", expired);
    }
}

pub async fn retention_pass(controller: &Controller) {
    if let Err(e) = controller.enforce_retention().await {
        error!("Backup retention sweep failed: {}", e);
    }
}

/// Drain the signal source and propose each signal. Returns how many
/// proposals were created (auto-applied, queued or failed).
pub async fn analyzer_pass(controller: &Controller, source: Arc<dyn SignalSource>) -> usize {
    let signals = match tokio::task::spawn_blocking(move || source.poll()).await {
        Ok(Ok(signals)) => signals,
        Ok(Err(e)) => {
            warn!("Signal source poll failed: {}", e);
            return 0;
        }
        Err(e) => {
            error!("Signal source poll panicked: {}", e);
            return 0;
        }
    };

    let mut created = 0;
    for signal in signals {
        let kind = signal.kind();
        match controller.propose(signal).await {
            Ok(outcome) => {
                debug!("{} signal -> {:?}", kind, outcome);
                if outcome.proposal_id().is_some() {
                    created += 1;
                }
                if let ProposeOutcome::AutoApprovedApplyFailed { proposal_id, error, .. } = &outcome {
                    warn!("Auto-approved proposal {} failed to apply: {}", proposal_id, error);
                }
            }
            Err(e) => warn!("Rejected {} signal: {}", kind, e),
        }
    }
    created
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::{ControllerConfig, PathsConfig};
    use crate::error::AppError;
    use crate::proposal::{AlertFrequency, CacheStats, ImprovementSignal};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct StaticSource {
        batches: Mutex<Vec<Vec<ImprovementSignal>>>,
    }

    impl SignalSource for StaticSource {
        fn poll(&self) -> Result<Vec<ImprovementSignal>, AppError> {
            Ok(self.batches.lock().unwrap().pop().unwrap_or_default())
        }
    }

    async fn controller() -> (TempDir, Arc<Controller>) {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig {
            config_dir: dir.path().join("config"),
            data_dir: dir.path().join("data"),
            signal_inbox: None,
        };
        let alerts = paths.config_dir.join("monitoring/alert_config.json");
        std::fs::create_dir_all(alerts.parent().unwrap()).unwrap();
        std::fs::write(&alerts, br#"{"thresholds": {"max_response_time": 10}}"#).unwrap();

        let controller = Controller::open(ControllerConfig::default(), &paths, Arc::new(SystemClock))
            .await
            .unwrap();
        (dir, Arc::new(controller))
    }

    #[tokio::test]
    async fn test_analyzer_pass_proposes_each_signal() {
        let (_dir, controller) = controller().await;
        let source = Arc::new(StaticSource {
            batches: Mutex::new(vec![vec![
                ImprovementSignal::AlertFrequency(AlertFrequency {
                    alert_type: "performance_degradation".into(),
                    server: "api".into(),
                    count: 8,
                }),
                // Below every threshold: no proposal
                ImprovementSignal::CacheEfficiency(CacheStats {
                    hit_rate: 0.5,
                    space_efficiency: 0.5,
                    total_entries: 10,
                    total_size_mb: 10.0,
                }),
            ]]),
        });

        assert_eq!(analyzer_pass(&controller, source.clone()).await, 1);
        assert_eq!(controller.list_pending().await.len(), 1);
        // Drained
        assert_eq!(analyzer_pass(&controller, source).await, 0);
    }

    #[tokio::test]
    async fn test_tasks_stop_on_shutdown() {
        let (_dir, controller) = controller().await;
        let source: Arc<dyn SignalSource> = Arc::new(StaticSource { batches: Mutex::new(vec![]) });
        let (tx, rx) = watch::channel(false);

        let tasks = spawn_background_tasks(controller, Some(source), rx);
        assert_eq!(tasks.len(), 4);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), tasks.join())
            .await
            .expect("background tasks did not stop");
    }
}
