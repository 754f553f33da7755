//! Sandbox lifecycle: create, run, score, clean up.
//!
//! [`SandboxController`] is the only writer of sandbox records (the resource
//! monitor owns the `resources` sub-record). The registry is bounded by
//! `max_sandboxes`; the capacity check and the insert happen under one lock
//! so concurrent callers can never overshoot it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, instrument};

use super::capability::CapabilityPolicy;
use super::environment::IsolatedEnvironment;
use super::error::{EnvironmentError, SandboxError, SandboxResult};
use super::executor::{ExecError, Executor};
use super::model::{
    CandidateModule, Performance, ResourceUsage, RiskLevel, Sandbox, SandboxId, SandboxOptions,
    SandboxStatus, SecurityViolation, TestResult, TestScenario,
};
use super::monitor::{EnvironmentProbe, ResourceLimits, ResourceMonitor, ResourceProbe};
use super::policy::Policy;
use super::verdict::{
    pass_rate, recommendations, Readiness, ScoreInputs, ScoringConfig, SecurityReport, Verdict,
    VerdictKind,
};
use crate::metrics::METRICS;
use crate::obs;

/// Controller-wide limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Upper bound on concurrently registered sandboxes.
    pub max_sandboxes: usize,
    /// Resource sampling period (milliseconds).
    pub monitor_interval_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            max_sandboxes: 10,
            monitor_interval_ms: 1_000,
        }
    }
}

struct SandboxEntry {
    record: Mutex<Sandbox>,
    resources: Arc<RwLock<ResourceUsage>>,
    status_tx: watch::Sender<SandboxStatus>,
    env: Arc<IsolatedEnvironment>,
    monitor: ResourceMonitor,
    timeout: Duration,
}

impl SandboxEntry {
    async fn transition(&self, next: SandboxStatus) -> SandboxResult<()> {
        let mut record = self.record.lock().await;
        if !record.status.can_transition_to(next) {
            return Err(SandboxError::InvalidTransition {
                from: record.status,
                to: next,
            });
        }
        record.status = next;
        let now = Utc::now();
        if next == SandboxStatus::Running {
            record.performance.started_at = now;
        }
        if next.is_terminal() {
            let elapsed = (now - record.performance.started_at).num_milliseconds().max(0);
            record.performance.ended_at = Some(now);
            record.performance.duration_ms = Some(elapsed as u64);
        }
        self.status_tx.send_replace(next);
        Ok(())
    }

    async fn snapshot(&self) -> Sandbox {
        let mut sandbox = self.record.lock().await.clone();
        sandbox.resources = self.resources.read().await.clone();
        sandbox
    }
}

/// What the main execution produced, before scoring.
struct Execution {
    kind: VerdictKind,
    output: Option<serde_json::Value>,
    runtime_errors: Vec<String>,
    elapsed_ms: u64,
}

/// Runs candidate modules end-to-end and produces verdicts.
pub struct SandboxController {
    settings: SandboxSettings,
    scoring: ScoringConfig,
    policy: Arc<dyn Policy>,
    executor: Arc<dyn Executor>,
    probe: Arc<dyn ResourceProbe>,
    sandboxes: Mutex<HashMap<SandboxId, Arc<SandboxEntry>>>,
    archive: Mutex<HashMap<String, Vec<TestResult>>>,
}

impl SandboxController {
    pub fn new(
        settings: SandboxSettings,
        scoring: ScoringConfig,
        policy: Arc<dyn Policy>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            settings,
            scoring,
            policy,
            executor,
            probe: Arc::new(EnvironmentProbe),
            sandboxes: Mutex::new(HashMap::new()),
            archive: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the default resource probe.
    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Longest a default-options run with `scenarios` scenarios can take:
    /// the main execution and every scenario each race the full timeout.
    pub fn run_budget(&self, scenarios: usize) -> Duration {
        let timeout = Duration::from_millis(self.policy.capabilities().default_timeout_ms);
        timeout.saturating_mul(u32::try_from(scenarios + 1).unwrap_or(u32::MAX))
    }

    fn effective_policy(&self, options: &SandboxOptions) -> CapabilityPolicy {
        let mut policy = self.policy.capabilities().clone();
        if let Some(timeout_ms) = options.timeout_ms {
            policy.default_timeout_ms = timeout_ms;
        }
        if let Some(max_memory) = options.max_memory_bytes {
            policy.max_memory_bytes = max_memory;
        }
        if let Some(max_cpu) = options.max_cpu_percent {
            policy.max_cpu_percent = max_cpu;
        }
        policy
    }

    /// Register a new sandbox for `module_id` and start its resource monitor.
    #[instrument(skip(self, options))]
    pub async fn create_sandbox(
        &self,
        module_id: &str,
        options: SandboxOptions,
    ) -> SandboxResult<SandboxId> {
        let mut sandboxes = self.sandboxes.lock().await;
        if sandboxes.len() >= self.settings.max_sandboxes {
            METRICS.inc_sandboxes_refused();
            return Err(SandboxError::ResourceExhausted {
                active: sandboxes.len(),
                max: self.settings.max_sandboxes,
            });
        }

        let id = SandboxId::new();
        let policy = self.effective_policy(&options);
        let timeout = Duration::from_millis(policy.default_timeout_ms);
        let limits = ResourceLimits {
            max_memory_bytes: policy.max_memory_bytes,
            max_cpu_percent: policy.max_cpu_percent,
        };
        let env = Arc::new(IsolatedEnvironment::new(id, policy));
        let resources = Arc::new(RwLock::new(ResourceUsage::default()));
        let (status_tx, status_rx) = watch::channel(SandboxStatus::Initializing);
        let monitor = ResourceMonitor::spawn(
            id,
            Arc::clone(&env),
            Arc::clone(&self.probe),
            limits,
            Duration::from_millis(self.settings.monitor_interval_ms.max(1)),
            Arc::clone(&resources),
            status_rx,
        );

        let record = Sandbox {
            id,
            module_id: module_id.to_string(),
            status: SandboxStatus::Initializing,
            resources: ResourceUsage::default(),
            violations: Vec::new(),
            test_results: Vec::new(),
            performance: Performance {
                started_at: Utc::now(),
                ended_at: None,
                duration_ms: None,
            },
        };

        sandboxes.insert(
            id,
            Arc::new(SandboxEntry {
                record: Mutex::new(record),
                resources,
                status_tx,
                env,
                monitor,
                timeout,
            }),
        );
        METRICS.inc_sandboxes_created();
        obs::emit_sandbox_created(&id, module_id, sandboxes.len());
        Ok(id)
    }

    async fn entry(&self, id: &SandboxId) -> SandboxResult<Arc<SandboxEntry>> {
        self.sandboxes
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or(SandboxError::NotFound(*id))
    }

    /// Screen, execute and score `code`, then run each scenario.
    ///
    /// Policy refusals, timeouts and runtime errors come back as verdict data.
    /// `Err` is reserved for misuse (unknown id, sandbox already run) and for
    /// failures of the sandbox machinery itself, in which case the sandbox is
    /// marked `failed`.
    #[instrument(skip(self, code, scenarios), fields(sandbox_id = %id))]
    pub async fn run_module_in_sandbox(
        &self,
        id: &SandboxId,
        code: &str,
        scenarios: &[TestScenario],
    ) -> SandboxResult<Verdict> {
        let entry = self.entry(id).await?;
        entry.transition(SandboxStatus::Running).await?;

        match self.run_inner(&entry, code, scenarios).await {
            Ok(verdict) => Ok(verdict),
            Err(e) => {
                let _ = entry.transition(SandboxStatus::Failed).await;
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        entry: &SandboxEntry,
        code: &str,
        scenarios: &[TestScenario],
    ) -> SandboxResult<Verdict> {
        let violations = self.policy.screen(code);
        METRICS.add_violations(violations.len() as u64);
        entry
            .record
            .lock()
            .await
            .violations
            .extend(violations.iter().cloned());

        if self.policy.blocks(&violations) {
            entry.transition(SandboxStatus::Failed).await?;
            let execution = Execution {
                kind: VerdictKind::SecurityViolation,
                output: None,
                runtime_errors: Vec::new(),
                elapsed_ms: 0,
            };
            return Ok(self.finish(entry, execution, violations, Vec::new()).await);
        }

        let execution = self.execute_main(entry, code).await?;
        if execution.kind == VerdictKind::ExecutionTimeout {
            METRICS.inc_timeouts();
            entry.transition(SandboxStatus::Failed).await?;
            return Ok(self.finish(entry, execution, violations, Vec::new()).await);
        }

        let mut results = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            results.push(self.run_scenario(entry, code, scenario).await);
        }
        entry
            .record
            .lock()
            .await
            .test_results
            .extend(results.iter().cloned());

        entry.transition(SandboxStatus::Completed).await?;
        Ok(self.finish(entry, execution, violations, results).await)
    }

    async fn execute_main(&self, entry: &SandboxEntry, code: &str) -> SandboxResult<Execution> {
        if entry.env.is_released() {
            return Err(EnvironmentError::Released.into());
        }
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            entry.timeout,
            self.executor
                .execute(code, &serde_json::Value::Null, Arc::clone(&entry.env)),
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        // A failed execution is one runtime error however many console lines
        // it wrote; console errors only count on their own after a success.
        let console_errors = || -> Vec<String> {
            entry
                .env
                .captured()
                .errors()
                .map(|l| format!("console error: {}", l.message))
                .collect()
        };
        let (kind, output, runtime_errors) = match outcome {
            Err(_elapsed) => (VerdictKind::ExecutionTimeout, None, console_errors()),
            Ok(Ok(value)) => (VerdictKind::Completed, Some(value), console_errors()),
            Ok(Err(e)) => (VerdictKind::Completed, None, vec![e.to_string()]),
        };

        Ok(Execution {
            kind,
            output,
            runtime_errors,
            elapsed_ms,
        })
    }

    async fn run_scenario(
        &self,
        entry: &SandboxEntry,
        code: &str,
        scenario: &TestScenario,
    ) -> TestResult {
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            entry.timeout,
            self.executor
                .execute(code, &scenario.input, Arc::clone(&entry.env)),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (actual_output, error) = match outcome {
            Err(_) => (
                None,
                Some(format!("timed out after {}ms", entry.timeout.as_millis())),
            ),
            Ok(Err(ExecError::Runtime(msg))) => (None, Some(msg)),
            Ok(Err(e)) => (None, Some(e.to_string())),
            Ok(Ok(value)) => (Some(value), None),
        };
        let passed = actual_output.as_ref() == Some(&scenario.expected_output);

        TestResult {
            name: scenario.name.clone(),
            input: scenario.input.clone(),
            expected_output: scenario.expected_output.clone(),
            actual_output,
            passed,
            duration_ms,
            error,
        }
    }

    async fn finish(
        &self,
        entry: &SandboxEntry,
        execution: Execution,
        violations: Vec<SecurityViolation>,
        test_results: Vec<TestResult>,
    ) -> Verdict {
        let risk_level = RiskLevel::from_violations(&violations);
        let inputs = ScoreInputs {
            runtime_errors: execution.runtime_errors.len(),
            violations: violations.len(),
            slow: execution.kind == VerdictKind::ExecutionTimeout
                || execution.elapsed_ms > self.scoring.slow_threshold_ms,
            pass_rate: pass_rate(&test_results),
        };
        let score = self.scoring.score(&inputs);
        let readiness = if execution.kind == VerdictKind::Completed {
            self.scoring.readiness(score, risk_level)
        } else {
            Readiness::NotReady
        };

        let mut issues = Vec::new();
        match execution.kind {
            VerdictKind::SecurityViolation => {
                issues.push("execution refused: high-severity policy violation".to_string())
            }
            VerdictKind::ExecutionTimeout => issues.push(format!(
                "execution timed out after {}ms",
                entry.timeout.as_millis()
            )),
            VerdictKind::Completed => {}
        }
        for v in &violations {
            issues.push(format!(
                "{:?} violation `{}` at line {}",
                v.severity, v.pattern, v.line
            ));
        }
        issues.extend(execution.runtime_errors.iter().cloned());
        if execution.kind == VerdictKind::Completed
            && execution.elapsed_ms > self.scoring.slow_threshold_ms
        {
            issues.push(format!(
                "slow execution: {}ms (threshold {}ms)",
                execution.elapsed_ms, self.scoring.slow_threshold_ms
            ));
        }
        for r in test_results.iter().filter(|r| !r.passed) {
            match &r.error {
                Some(err) => issues.push(format!("scenario `{}` failed: {err}", r.name)),
                None => issues.push(format!(
                    "scenario `{}` failed: expected {}, got {}",
                    r.name,
                    r.expected_output,
                    r.actual_output
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "nothing".to_string())
                )),
            }
        }

        let record = entry.record.lock().await;
        let verdict = Verdict {
            sandbox_id: record.id,
            module_id: record.module_id.clone(),
            kind: execution.kind,
            score,
            readiness,
            output: execution.output,
            issues,
            recommendations: recommendations(
                execution.kind,
                &inputs,
                &violations,
                test_results.len(),
            ),
            security: SecurityReport {
                violations,
                risk_level,
            },
            test_results,
            performance: record.performance.clone(),
        };
        obs::emit_verdict(&verdict);
        verdict
    }

    /// Remove a sandbox, archiving its test results. Returns `false` when the
    /// id is not registered (already cleaned up), in which case nothing
    /// happens.
    #[instrument(skip(self), fields(sandbox_id = %id))]
    pub async fn cleanup_sandbox(&self, id: &SandboxId) -> bool {
        let Some(entry) = self.sandboxes.lock().await.remove(id) else {
            return false;
        };
        entry.monitor.stop();

        let (module_id, results) = {
            let record = entry.record.lock().await;
            (record.module_id.clone(), record.test_results.clone())
        };
        if !results.is_empty() {
            self.archive
                .lock()
                .await
                .entry(module_id.clone())
                .or_default()
                .extend(results);
        }
        entry.env.release();
        info!(event = "sandbox.cleaned_up", sandbox_id = %id, module_id = %module_id);
        true
    }

    pub async fn sandbox_status(&self, id: &SandboxId) -> SandboxResult<SandboxStatus> {
        let entry = self.entry(id).await?;
        let status = entry.record.lock().await.status;
        Ok(status)
    }

    /// Full copy of a sandbox record including its latest resource sample.
    pub async fn sandbox_snapshot(&self, id: &SandboxId) -> SandboxResult<Sandbox> {
        let entry = self.entry(id).await?;
        Ok(entry.snapshot().await)
    }

    pub async fn active_count(&self) -> usize {
        self.sandboxes.lock().await.len()
    }

    /// Test results archived for `module_id` by earlier cleanups.
    pub async fn archived_results(&self, module_id: &str) -> Vec<TestResult> {
        self.archive
            .lock()
            .await
            .get(module_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Create, run and clean up a sandbox for one module.
    pub async fn validate(
        &self,
        module: &CandidateModule,
        options: SandboxOptions,
    ) -> SandboxResult<Verdict> {
        let id = self.create_sandbox(&module.id, options).await?;
        let verdict = self
            .run_module_in_sandbox(&id, &module.source_code, &module.test_scenarios)
            .await;
        self.cleanup_sandbox(&id).await;
        verdict
    }
}
