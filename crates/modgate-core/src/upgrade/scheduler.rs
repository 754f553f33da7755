//! Background scheduling and maintenance.
//!
//! Each tick starts the next queued job when no upgrade is running, then
//! runs a maintenance pass over the collaborators. Maintenance never claims
//! the in-flight flag; it skips itself while an upgrade holds the
//! collaborator guard.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::orchestrator::UpgradeOrchestrator;

/// What a maintenance pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceOutcome {
    /// An upgrade was running or held the collaborator guard.
    Skipped,
    Ran { drained: bool, refreshed: bool },
}

/// What one scheduler tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    /// Job started this tick and whether it succeeded.
    pub job: Option<(Uuid, bool)>,
    pub maintenance: MaintenanceOutcome,
}

impl UpgradeOrchestrator {
    /// Run one scheduler pass.
    pub async fn run_scheduler_tick(&self) -> TickOutcome {
        let job = self.start_next_job().await;
        let maintenance = self.run_maintenance().await;
        TickOutcome { job, maintenance }
    }

    async fn start_next_job(&self) -> Option<(Uuid, bool)> {
        if self.is_upgrading() || self.queue.lock().await.is_empty() {
            return None;
        }
        let flight = self.try_claim()?;
        let job = self.queue.lock().await.pop()?;
        let id = job.id;
        info!(event = "scheduler.dequeued", job_id = %id, priority = ?job.priority);
        let ok = match self.run_job(job, flight).await {
            Ok(_) => true,
            Err(e) => {
                warn!(event = "scheduler.job_failed", job_id = %id, error = %e);
                false
            }
        };
        Some((id, ok))
    }

    /// Drain the integration backlog and occasionally refresh learning.
    pub async fn run_maintenance(&self) -> MaintenanceOutcome {
        if self.is_upgrading() {
            return MaintenanceOutcome::Skipped;
        }
        let Ok(_guard) = self.collaborator_guard.try_lock() else {
            return MaintenanceOutcome::Skipped;
        };

        let mut drained = false;
        if self.integrator().pending().await > 0 {
            match self.integrator().process_queue().await {
                Ok(()) => drained = true,
                Err(e) => warn!(event = "scheduler.integration_failed", error = %e),
            }
        }

        let mut refreshed = false;
        if rand::random::<f64>() < self.config().refresh_probability {
            match self.learner().refresh().await {
                Ok(()) => refreshed = true,
                Err(e) => warn!(event = "scheduler.refresh_failed", error = %e),
            }
        }

        debug!(event = "scheduler.maintenance", drained, refreshed);
        MaintenanceOutcome::Ran { drained, refreshed }
    }
}

/// Run [`UpgradeOrchestrator::run_scheduler_tick`] every
/// `scheduler_interval_ms` until `shutdown` turns `true` or its sender drops.
pub fn spawn_scheduler(
    orchestrator: Arc<UpgradeOrchestrator>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(orchestrator.config().scheduler_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(event = "scheduler.started", interval_ms = period.as_millis() as u64);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    orchestrator.run_scheduler_tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(event = "scheduler.stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{MemoryLiveSystem, QueueIntegrator, RecordingLearner};
    use crate::sandbox::{
        CandidateModule, ExecContext, FnExecutor, PatternPolicy, SandboxController,
        SandboxSettings, ScoringConfig,
    };
    use crate::upgrade::{KnowledgeIntegrationCollaborator, OrchestratorConfig, UpgradeConfig};

    fn orchestrator(
        refresh_probability: f64,
        integrator: Arc<QueueIntegrator>,
        learner: Arc<RecordingLearner>,
    ) -> UpgradeOrchestrator {
        let executor = FnExecutor::new(|ctx: ExecContext| async move { Ok(ctx.input) });
        let controller = SandboxController::new(
            SandboxSettings::default(),
            ScoringConfig::default(),
            Arc::new(PatternPolicy::default()),
            Arc::new(executor),
        );
        UpgradeOrchestrator::new(
            OrchestratorConfig {
                refresh_probability,
                sandbox_poll_interval_ms: 5,
                integration_retry_delay_ms: 5,
                scheduler_interval_ms: 10,
                ..Default::default()
            },
            Arc::new(controller),
            learner,
            integrator,
            Arc::new(MemoryLiveSystem::default()),
        )
    }

    #[tokio::test]
    async fn test_maintenance_drains_and_refreshes() {
        let integrator = Arc::new(QueueIntegrator::new(3, 3));
        let learner = Arc::new(RecordingLearner::default());
        let orch = orchestrator(1.0, Arc::clone(&integrator), Arc::clone(&learner));

        let out = orch.run_maintenance().await;
        assert_eq!(
            out,
            MaintenanceOutcome::Ran {
                drained: true,
                refreshed: true
            }
        );
        assert_eq!(integrator.pending().await, 0);
        assert_eq!(learner.refresh_count(), 1);
        assert!(!orch.is_upgrading());
    }

    #[tokio::test]
    async fn test_maintenance_skips_when_guard_held() {
        let integrator = Arc::new(QueueIntegrator::new(3, 3));
        let orch = orchestrator(1.0, Arc::clone(&integrator), Arc::default());
        let _held = orch.collaborator_guard.lock().await;
        assert_eq!(orch.run_maintenance().await, MaintenanceOutcome::Skipped);
        assert_eq!(integrator.pending().await, 3);
    }

    #[tokio::test]
    async fn test_never_refreshes_at_zero_probability() {
        let learner = Arc::new(RecordingLearner::default());
        let orch = orchestrator(0.0, Arc::new(QueueIntegrator::new(0, 1)), Arc::clone(&learner));
        for _ in 0..20 {
            orch.run_maintenance().await;
        }
        assert_eq!(learner.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_tick_runs_one_queued_job() {
        let orch = orchestrator(0.0, Arc::new(QueueIntegrator::new(0, 1)), Arc::default());
        let module = CandidateModule::new("m", "m", "let a = 1;");
        let id = orch
            .schedule_upgrade(UpgradeConfig::new(vec![module.clone()]))
            .await
            .unwrap();
        orch.schedule_upgrade(UpgradeConfig::new(vec![module]))
            .await
            .unwrap();

        let tick = orch.run_scheduler_tick().await;
        assert_eq!(tick.job, Some((id, true)));
        assert_eq!(orch.upgrade_status().await.queue_length, 1);
    }

    #[tokio::test]
    async fn test_spawned_scheduler_stops_on_shutdown() {
        let orch = Arc::new(orchestrator(
            0.0,
            Arc::new(QueueIntegrator::new(0, 1)),
            Arc::default(),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = spawn_scheduler(Arc::clone(&orch), rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
