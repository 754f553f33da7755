//! The seven-phase upgrade workflow.
//!
//! [`UpgradeOrchestrator`] runs at most one upgrade at a time. The in-flight
//! flag is claimed with a compare-and-set before anything else happens and is
//! released by a drop guard, so it resets on success, on rollback and if the
//! workflow future is dropped. Any phase error triggers a rollback that runs
//! to completion before the error is returned.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn, Instrument};
use uuid::Uuid;

use super::collaborators::{
    Artifact, Backup, KnowledgeIntegrationCollaborator, LearningCollaborator, LiveSystem,
    Optimizable, SessionHandle,
};
use super::error::{PhaseError, UpgradeError, UpgradeResult};
use super::health::HealthReport;
use super::job::{JobQueue, UpgradeConfig, UpgradeJob};
use super::phase::UpgradePhase;
use crate::metrics::METRICS;
use crate::obs;
use crate::sandbox::{
    CandidateModule, Readiness, SandboxController, SandboxError, SandboxId, SandboxOptions,
    SandboxResult, Verdict,
};

/// Workflow timing and thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Minimum aggregate health (0..=1) for validation to pass.
    pub health_threshold: f64,
    /// How many times sandbox testing polls for outstanding verdicts.
    pub sandbox_poll_attempts: u32,
    /// Delay between polls, and between sandbox creation retries (milliseconds).
    pub sandbox_poll_interval_ms: u64,
    /// Wait before the second integration drain (milliseconds).
    pub integration_retry_delay_ms: u64,
    pub scheduler_interval_ms: u64,
    /// Chance per maintenance pass of asking the learner to refresh.
    pub refresh_probability: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_threshold: 0.8,
            sandbox_poll_attempts: 30,
            sandbox_poll_interval_ms: 500,
            integration_retry_delay_ms: 1_000,
            scheduler_interval_ms: 5_000,
            refresh_probability: 0.05,
        }
    }
}

/// Outcome of the most recently finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeSummary {
    pub job_id: Uuid,
    pub success: bool,
    pub failed_phase: Option<UpgradePhase>,
    pub reason: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Result of a successful upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeReport {
    pub job_id: Uuid,
    pub deployed: Vec<String>,
    /// Modules validated but held back because they were not ready.
    pub skipped: Vec<String>,
    pub health: HealthReport,
    pub verdicts: Vec<Verdict>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

/// Point-in-time view of the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeStatus {
    pub is_upgrading: bool,
    pub current_phase: Option<UpgradePhase>,
    pub progress: u8,
    pub queue_length: usize,
    pub last_outcome: Option<UpgradeSummary>,
}

#[derive(Debug, Default)]
struct WorkflowState {
    current_phase: Option<UpgradePhase>,
    progress: u8,
    last_outcome: Option<UpgradeSummary>,
}

/// Holds the in-flight flag; clears it on drop.
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type Registered = Arc<std::sync::Mutex<HashSet<SandboxId>>>;

fn lock_registered(r: &Registered) -> std::sync::MutexGuard<'_, HashSet<SandboxId>> {
    r.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-job bookkeeping, discarded when the job ends.
#[derive(Default)]
struct Attempt {
    backup: Option<Backup>,
    sessions: HashMap<String, SessionHandle>,
    verdicts: HashMap<String, Verdict>,
    sandbox_ids: Registered,
    health: Option<HealthReport>,
    deployed: Vec<String>,
    skipped: Vec<String>,
    warnings: Vec<String>,
}

/// Drives upgrade jobs through the workflow.
pub struct UpgradeOrchestrator {
    config: OrchestratorConfig,
    sandboxes: Arc<SandboxController>,
    learner: Arc<dyn LearningCollaborator>,
    integrator: Arc<dyn KnowledgeIntegrationCollaborator>,
    live: Arc<dyn LiveSystem>,
    optimizables: Vec<Arc<dyn Optimizable>>,
    upgrading: AtomicBool,
    /// Serializes collaborator use between upgrades and scheduler maintenance.
    pub(crate) collaborator_guard: Mutex<()>,
    state: Mutex<WorkflowState>,
    pub(crate) queue: Mutex<JobQueue>,
}

impl UpgradeOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        sandboxes: Arc<SandboxController>,
        learner: Arc<dyn LearningCollaborator>,
        integrator: Arc<dyn KnowledgeIntegrationCollaborator>,
        live: Arc<dyn LiveSystem>,
    ) -> Self {
        Self {
            config,
            sandboxes,
            learner,
            integrator,
            live,
            optimizables: Vec::new(),
            upgrading: AtomicBool::new(false),
            collaborator_guard: Mutex::new(()),
            state: Mutex::new(WorkflowState::default()),
            queue: Mutex::new(JobQueue::new()),
        }
    }

    /// Register a component to optimize during cleanup.
    pub fn with_optimizable(mut self, component: Arc<dyn Optimizable>) -> Self {
        self.optimizables.push(component);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn sandboxes(&self) -> &Arc<SandboxController> {
        &self.sandboxes
    }

    pub(crate) fn learner(&self) -> &Arc<dyn LearningCollaborator> {
        &self.learner
    }

    pub(crate) fn integrator(&self) -> &Arc<dyn KnowledgeIntegrationCollaborator> {
        &self.integrator
    }

    pub fn is_upgrading(&self) -> bool {
        self.upgrading.load(Ordering::Acquire)
    }

    pub(crate) fn try_claim(&self) -> Option<InFlight<'_>> {
        InFlight::acquire(&self.upgrading)
    }

    fn check_config(config: &UpgradeConfig) -> UpgradeResult<()> {
        if config.modules.is_empty() {
            return Err(UpgradeError::InvalidConfig("no modules to upgrade".into()));
        }
        let mut seen = HashSet::new();
        for module in &config.modules {
            if !seen.insert(module.id.as_str()) {
                return Err(UpgradeError::InvalidConfig(format!(
                    "duplicate module id {}",
                    module.id
                )));
            }
        }
        if let Some(t) = config.health_threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(UpgradeError::InvalidConfig(format!(
                    "health threshold {t} outside 0..=1"
                )));
            }
        }
        Ok(())
    }

    /// Queue a job for the scheduler. Never starts it.
    pub async fn schedule_upgrade(&self, config: UpgradeConfig) -> UpgradeResult<Uuid> {
        Self::check_config(&config)?;
        let job = UpgradeJob::new(config);
        let id = job.id;
        let mut queue = self.queue.lock().await;
        queue.push(job);
        info!(event = "upgrade.scheduled", job_id = %id, queue_length = queue.len());
        Ok(id)
    }

    /// Run an upgrade now, or fail with [`UpgradeError::Busy`].
    #[instrument(skip_all, fields(modules = config.modules.len()))]
    pub async fn start_upgrade(&self, config: UpgradeConfig) -> UpgradeResult<UpgradeReport> {
        Self::check_config(&config)?;
        let flight = self.try_claim().ok_or(UpgradeError::Busy)?;
        self.run_job(UpgradeJob::new(config), flight).await
    }

    pub async fn upgrade_status(&self) -> UpgradeStatus {
        let queue_length = self.queue.lock().await.len();
        let state = self.state.lock().await;
        UpgradeStatus {
            is_upgrading: self.is_upgrading(),
            current_phase: state.current_phase,
            progress: state.progress,
            queue_length,
            last_outcome: state.last_outcome.clone(),
        }
    }

    /// Run `job` while holding `_flight`.
    pub(crate) async fn run_job(
        &self,
        job: UpgradeJob,
        _flight: InFlight<'_>,
    ) -> UpgradeResult<UpgradeReport> {
        let span = obs::job_span(&job.id.to_string());
        async {
            let _guard = self.collaborator_guard.lock().await;
            self.execute(job).await
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, mut job: UpgradeJob) -> UpgradeResult<UpgradeReport> {
        let started = Instant::now();
        let job_id = job.id.to_string();
        let mut attempt = Attempt::default();
        obs::emit_upgrade_started(&job_id, job.config.modules.len());

        for phase in UpgradePhase::ALL {
            job.phase = Some(phase);
            {
                let mut state = self.state.lock().await;
                state.current_phase = Some(phase);
                state.progress = phase.progress();
            }
            obs::emit_phase_entered(&job_id, phase, phase.progress());

            if let Err(source) = self.run_phase(phase, &job, &mut attempt).await {
                obs::emit_upgrade_failed(&job_id, phase, &source);
                let rollback_failure = self.rollback(&job_id, &mut attempt).await;
                METRICS.inc_upgrades_failed();
                self.finish(UpgradeSummary {
                    job_id: job.id,
                    success: false,
                    failed_phase: Some(phase),
                    reason: Some(source.to_string()),
                    finished_at: Utc::now(),
                })
                .await;
                obs::emit_upgrade_finished(&job_id, started.elapsed().as_millis() as u64, false);
                return Err(UpgradeError::PhaseFailed {
                    phase,
                    source,
                    rollback_failure,
                });
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let verdicts: Vec<Verdict> = job
            .config
            .modules
            .iter()
            .filter_map(|m| attempt.verdicts.remove(&m.id))
            .collect();
        let report = UpgradeReport {
            job_id: job.id,
            deployed: std::mem::take(&mut attempt.deployed),
            skipped: std::mem::take(&mut attempt.skipped),
            health: attempt
                .health
                .take()
                .unwrap_or_else(|| HealthReport::from_verdicts(&verdicts)),
            verdicts,
            warnings: std::mem::take(&mut attempt.warnings),
            duration_ms,
        };

        METRICS.inc_upgrades_succeeded();
        {
            let mut state = self.state.lock().await;
            state.progress = 100;
        }
        self.finish(UpgradeSummary {
            job_id: job.id,
            success: true,
            failed_phase: None,
            reason: None,
            finished_at: Utc::now(),
        })
        .await;
        obs::emit_upgrade_finished(&job_id, duration_ms, true);
        METRICS.flush();
        Ok(report)
    }

    async fn finish(&self, summary: UpgradeSummary) {
        let mut state = self.state.lock().await;
        state.current_phase = None;
        state.last_outcome = Some(summary);
    }

    async fn run_phase(
        &self,
        phase: UpgradePhase,
        job: &UpgradeJob,
        attempt: &mut Attempt,
    ) -> Result<(), PhaseError> {
        match phase {
            UpgradePhase::Preparation => self.prepare(job, attempt).await,
            UpgradePhase::BackgroundLearning => self.learn(job, attempt).await,
            UpgradePhase::SandboxTesting => self.test_in_sandboxes(job, attempt).await,
            UpgradePhase::Integration => self.integrate(attempt).await,
            UpgradePhase::Validation => self.validate(job, attempt),
            UpgradePhase::Deployment => self.deploy(job, attempt).await,
            UpgradePhase::Cleanup => self.cleanup(attempt).await,
        }
    }

    async fn prepare(&self, job: &UpgradeJob, attempt: &mut Attempt) -> Result<(), PhaseError> {
        self.live
            .check_prerequisites()
            .await
            .map_err(|e| PhaseError::Prerequisites(e.to_string()))?;
        attempt.backup = Some(self.live.snapshot().await?);
        attempt.sessions.reserve(job.config.modules.len());
        attempt.verdicts.reserve(job.config.modules.len());
        Ok(())
    }

    async fn learn(&self, job: &UpgradeJob, attempt: &mut Attempt) -> Result<(), PhaseError> {
        let handles: Vec<_> = job
            .config
            .modules
            .iter()
            .map(|module| {
                let learner = Arc::clone(&self.learner);
                let module_id = module.id.clone();
                let data = job.config.learning_data.clone();
                let handle =
                    tokio::spawn(async move { learner.start_learning(&module_id, &data).await });
                (module.id.clone(), handle)
            })
            .collect();

        let (ids, handles): (Vec<String>, Vec<_>) = handles.into_iter().unzip();
        let results = futures::future::join_all(handles).await;

        let mut first_error = None;
        for (module_id, result) in ids.into_iter().zip(results) {
            let err = match result {
                Ok(Ok(session)) => {
                    attempt.sessions.insert(module_id, session);
                    continue;
                }
                Ok(Err(e)) => PhaseError::Learning {
                    module_id,
                    reason: e.to_string(),
                },
                Err(join) => PhaseError::TaskFailed {
                    module_id,
                    reason: join.to_string(),
                },
            };
            first_error.get_or_insert(err);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn test_in_sandboxes(
        &self,
        job: &UpgradeJob,
        attempt: &mut Attempt,
    ) -> Result<(), PhaseError> {
        let retry = Duration::from_millis(self.config.sandbox_poll_interval_ms);
        let tasks: Vec<_> = job
            .config
            .modules
            .iter()
            .map(|module| {
                let controller = Arc::clone(&self.sandboxes);
                let registered = Arc::clone(&attempt.sandbox_ids);
                let module = module.clone();
                let id = module.id.clone();
                let handle = tokio::spawn(
                    async move { validate_module(controller, registered, module, retry).await }
                        .in_current_span(),
                );
                (id, handle)
            })
            .collect();

        let budget = self.sandbox_poll_budget(&job.config.modules);
        let mut polls = 0;
        while !tasks.iter().all(|(_, h)| h.is_finished()) {
            if polls >= budget {
                let mut pending = 0;
                for (_, handle) in &tasks {
                    if !handle.is_finished() {
                        pending += 1;
                        handle.abort();
                    }
                }
                for (_, handle) in tasks {
                    let _ = handle.await;
                }
                return Err(PhaseError::SandboxStalled { pending });
            }
            polls += 1;
            tokio::time::sleep(retry).await;
        }

        for (module_id, handle) in tasks {
            match handle.await {
                Ok(Ok(verdict)) => {
                    attempt.verdicts.insert(module_id, verdict);
                }
                Ok(Err(e)) => return Err(PhaseError::Sandbox(e)),
                Err(join) => {
                    return Err(PhaseError::TaskFailed {
                        module_id,
                        reason: join.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Polls allowed before sandbox testing counts as stalled.
    ///
    /// Every run may legitimately use its full timeout for the main execution
    /// and for each scenario, and modules beyond `max_sandboxes` wait for a
    /// free slot. The configured attempts are slack on top of that.
    fn sandbox_poll_budget(&self, modules: &[CandidateModule]) -> u32 {
        let interval_ms = self.config.sandbox_poll_interval_ms.max(1);
        let per_run = modules
            .iter()
            .map(|m| self.sandboxes.run_budget(m.test_scenarios.len()))
            .max()
            .unwrap_or_default();
        let waves = modules
            .len()
            .div_ceil(self.sandboxes.settings().max_sandboxes.max(1));
        let needed_ms = (per_run.as_millis() as u64).saturating_mul(waves as u64);
        let needed_polls = u32::try_from(needed_ms.div_ceil(interval_ms)).unwrap_or(u32::MAX);
        self.config.sandbox_poll_attempts.saturating_add(needed_polls)
    }

    async fn integrate(&self, attempt: &mut Attempt) -> Result<(), PhaseError> {
        self.integrator.process_queue().await?;
        if self.integrator.pending().await == 0 {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(self.config.integration_retry_delay_ms)).await;
        self.integrator.process_queue().await?;
        let remaining = self.integrator.pending().await;
        if remaining > 0 {
            warn!(event = "upgrade.integration_backlog", remaining = remaining);
            attempt
                .warnings
                .push(format!("{remaining} integration item(s) still pending"));
        }
        Ok(())
    }

    fn validate(&self, job: &UpgradeJob, attempt: &mut Attempt) -> Result<(), PhaseError> {
        let threshold = job
            .config
            .health_threshold
            .unwrap_or(self.config.health_threshold);
        let report = HealthReport::from_verdicts(
            job.config
                .modules
                .iter()
                .filter_map(|m| attempt.verdicts.get(&m.id)),
        );
        info!(
            event = "upgrade.health",
            score = report.score,
            threshold = threshold,
        );
        if !report.passes(threshold) {
            return Err(PhaseError::ValidationFailed {
                score: report.score,
                threshold,
            });
        }
        attempt.health = Some(report);
        Ok(())
    }

    async fn deploy(&self, job: &UpgradeJob, attempt: &mut Attempt) -> Result<(), PhaseError> {
        for module in &job.config.modules {
            let Some(verdict) = attempt.verdicts.get(&module.id) else {
                continue;
            };
            if verdict.is_failure() || verdict.readiness == Readiness::NotReady {
                warn!(
                    event = "upgrade.module_held_back",
                    module_id = %module.id,
                    score = verdict.score,
                );
                attempt.warnings.push(format!(
                    "module {} not deployed: not ready (score {:.1})",
                    module.id, verdict.score
                ));
                attempt.skipped.push(module.id.clone());
                continue;
            }
            let artifact = Artifact::from_verdict(module, verdict);
            self.live
                .activate(&artifact)
                .await
                .map_err(|e| PhaseError::Deployment {
                    module_id: module.id.clone(),
                    reason: e.to_string(),
                })?;
            info!(
                event = "upgrade.module_activated",
                module_id = %module.id,
                digest = %artifact.digest,
            );
            attempt.deployed.push(module.id.clone());
        }
        self.live.update_configuration(&attempt.deployed).await?;
        Ok(())
    }

    async fn cleanup(&self, attempt: &mut Attempt) -> Result<(), PhaseError> {
        attempt.backup = None;
        for component in &self.optimizables {
            if let Err(e) = component.optimize().await {
                warn!(event = "upgrade.optimize_failed", component = component.name(), error = %e);
                attempt
                    .warnings
                    .push(format!("optimize {} failed: {e}", component.name()));
            }
        }
        attempt.sessions.clear();
        lock_registered(&attempt.sandbox_ids).clear();
        Ok(())
    }

    /// Undo what the attempt did. Returns the restore error, if any.
    async fn rollback(&self, job_id: &str, attempt: &mut Attempt) -> Option<String> {
        METRICS.inc_rollbacks();
        let mut failure = None;
        if let Some(backup) = attempt.backup.take() {
            if let Err(e) = self.live.restore(&backup).await {
                METRICS.inc_rollback_failures();
                obs::emit_rollback_error(job_id, &e);
                failure = Some(e.to_string());
            }
        }

        let stale: Vec<SandboxId> = lock_registered(&attempt.sandbox_ids).drain().collect();
        for id in &stale {
            self.sandboxes.cleanup_sandbox(id).await;
        }

        attempt.sessions.clear();
        attempt.verdicts.clear();
        attempt.deployed.clear();
        attempt.skipped.clear();
        attempt.health = None;
        info!(
            event = "upgrade.rolled_back",
            job_id = %job_id,
            sandboxes_cleaned = stale.len(),
            restore_failed = failure.is_some(),
        );
        failure
    }
}

/// Create (retrying while at capacity), run and clean up one module's sandbox.
async fn validate_module(
    controller: Arc<SandboxController>,
    registered: Registered,
    module: CandidateModule,
    retry: Duration,
) -> SandboxResult<Verdict> {
    let id = loop {
        match controller
            .create_sandbox(&module.id, SandboxOptions::default())
            .await
        {
            Ok(id) => break id,
            Err(SandboxError::ResourceExhausted { .. }) => tokio::time::sleep(retry).await,
            Err(e) => return Err(e),
        }
    };
    lock_registered(&registered).insert(id);

    let verdict = controller
        .run_module_in_sandbox(&id, &module.source_code, &module.test_scenarios)
        .await;
    controller.cleanup_sandbox(&id).await;
    lock_registered(&registered).remove(&id);
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{MemoryLiveSystem, QueueIntegrator, RecordingLearner};
    use crate::sandbox::{ExecContext, FnExecutor, PatternPolicy, SandboxSettings, ScoringConfig};

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            sandbox_poll_attempts: 20,
            sandbox_poll_interval_ms: 5,
            integration_retry_delay_ms: 5,
            scheduler_interval_ms: 10,
            ..Default::default()
        }
    }

    fn orchestrator(live: Arc<MemoryLiveSystem>) -> UpgradeOrchestrator {
        let executor = FnExecutor::new(|ctx: ExecContext| async move { Ok(ctx.input) });
        let controller = SandboxController::new(
            SandboxSettings::default(),
            ScoringConfig::default(),
            Arc::new(PatternPolicy::default()),
            Arc::new(executor),
        );
        UpgradeOrchestrator::new(
            fast_config(),
            Arc::new(controller),
            Arc::new(RecordingLearner::default()),
            Arc::new(QueueIntegrator::new(0, 1)),
            live,
        )
    }

    fn module(id: &str) -> CandidateModule {
        CandidateModule::new(id, id, "const x = 1;")
    }

    #[test]
    fn test_poll_budget_covers_scenarios_and_capacity_waves() {
        let orch = orchestrator(Arc::new(MemoryLiveSystem::default()));
        let with_scenarios = module("a")
            .with_scenario(crate::sandbox::TestScenario::new("1", 1.into(), 1.into()))
            .with_scenario(crate::sandbox::TestScenario::new("2", 2.into(), 2.into()))
            .with_scenario(crate::sandbox::TestScenario::new("3", 3.into(), 3.into()));
        // 4 runs of 5s at 5ms per poll, plus the configured 20.
        assert_eq!(orch.sandbox_poll_budget(&[with_scenarios]), 4_020);

        let many: Vec<_> = (0..11).map(|i| module(&format!("m{i}"))).collect();
        // 11 modules over 10 slots is two waves of one 5s run.
        assert_eq!(orch.sandbox_poll_budget(&many), 2_020);
    }

    #[tokio::test]
    async fn test_empty_config_is_rejected_without_claiming() {
        let orch = orchestrator(Arc::new(MemoryLiveSystem::default()));
        let err = orch.start_upgrade(UpgradeConfig::default()).await.unwrap_err();
        assert!(matches!(err, UpgradeError::InvalidConfig(_)));
        assert!(!orch.is_upgrading());
    }

    #[tokio::test]
    async fn test_duplicate_modules_rejected() {
        let orch = orchestrator(Arc::new(MemoryLiveSystem::default()));
        let cfg = UpgradeConfig::new(vec![module("a"), module("a")]);
        assert!(matches!(
            orch.schedule_upgrade(cfg).await,
            Err(UpgradeError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_successful_upgrade_deploys_and_reports() {
        let live = Arc::new(MemoryLiveSystem::default());
        let orch = orchestrator(Arc::clone(&live));
        let report = orch
            .start_upgrade(UpgradeConfig::new(vec![module("a"), module("b")]))
            .await
            .unwrap();

        assert_eq!(report.deployed, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(report.verdicts.len(), 2);
        assert_eq!(live.active_modules(), vec!["a".to_string(), "b".to_string()]);

        let status = orch.upgrade_status().await;
        assert!(!status.is_upgrading);
        assert_eq!(status.progress, 100);
        assert_eq!(status.current_phase, None);
        assert!(status.last_outcome.unwrap().success);
        assert_eq!(orch.sandboxes().active_count().await, 0);
    }

    #[tokio::test]
    async fn test_prerequisite_failure_names_preparation() {
        let live = Arc::new(MemoryLiveSystem::default());
        live.fail_prerequisites(true);
        let orch = orchestrator(Arc::clone(&live));
        let err = orch
            .start_upgrade(UpgradeConfig::new(vec![module("a")]))
            .await
            .unwrap_err();
        assert_eq!(err.failed_phase(), Some(UpgradePhase::Preparation));
        assert_eq!(live.restore_count(), 0);
        assert!(!orch.is_upgrading());
    }

    #[tokio::test]
    async fn test_restore_failure_is_reported_alongside_original() {
        let live = Arc::new(MemoryLiveSystem::default());
        live.fail_restore(true);
        let orch = orchestrator(Arc::clone(&live));
        let cfg = UpgradeConfig {
            health_threshold: Some(1.0),
            ..UpgradeConfig::new(vec![CandidateModule::new("a", "a", "require('x')")])
        };
        match orch.start_upgrade(cfg).await.unwrap_err() {
            UpgradeError::PhaseFailed {
                phase,
                source,
                rollback_failure,
            } => {
                assert_eq!(phase, UpgradePhase::Validation);
                assert!(matches!(source, PhaseError::ValidationFailed { .. }));
                assert!(rollback_failure.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_in_flight_guard_resets_flag() {
        let flag = AtomicBool::new(false);
        {
            let _g = InFlight::acquire(&flag).unwrap();
            assert!(InFlight::acquire(&flag).is_none());
        }
        assert!(!flag.load(Ordering::Acquire));
    }
}
