//! Sandbox records and the values that flow through a validation run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one sandbox run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(pub Uuid);

impl SandboxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sbx-{}", self.0)
    }
}

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Initializing,
    Running,
    Completed,
    Failed,
}

impl SandboxStatus {
    /// `true` for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, SandboxStatus::Completed | SandboxStatus::Failed)
    }

    /// Transitions only move forward: initializing -> running -> {completed, failed}.
    ///
    /// An initializing sandbox may fail directly (it never started running).
    pub fn can_transition_to(self, next: SandboxStatus) -> bool {
        matches!(
            (self, next),
            (SandboxStatus::Initializing, SandboxStatus::Running)
                | (SandboxStatus::Initializing, SandboxStatus::Failed)
                | (SandboxStatus::Running, SandboxStatus::Completed)
                | (SandboxStatus::Running, SandboxStatus::Failed)
        )
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxStatus::Initializing => "initializing",
            SandboxStatus::Running => "running",
            SandboxStatus::Completed => "completed",
            SandboxStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Severity attached to a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// One policy-rule match in candidate source. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityViolation {
    /// Name of the rule that matched (e.g. `eval`).
    pub pattern: String,
    /// Capability the matched construct would exercise.
    pub capability: String,
    pub severity: Severity,
    /// 1-based source line of the match.
    pub line: usize,
}

/// Aggregate risk derived from a set of violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// The highest severity present decides the risk; no violations (or only
    /// `low` ones) is `Low`.
    pub fn from_violations(violations: &[SecurityViolation]) -> Self {
        match violations.iter().map(|v| v.severity).max() {
            Some(Severity::High) => RiskLevel::High,
            Some(Severity::Medium) => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }
}

/// Caller-supplied acceptance check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestScenario {
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
    pub expected_output: serde_json::Value,
}

impl TestScenario {
    pub fn new(
        name: impl Into<String>,
        input: serde_json::Value,
        expected_output: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            input,
            expected_output,
        }
    }
}

/// Outcome of one [`TestScenario`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub input: serde_json::Value,
    pub expected_output: serde_json::Value,
    pub actual_output: Option<serde_json::Value>,
    pub passed: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Latest resource sample of a sandbox. Written only by the resource monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub peak_memory_bytes: u64,
    pub cpu_percent: f64,
    pub samples: u64,
    pub threshold_breaches: u64,
}

/// Wall-clock bookkeeping of a sandbox run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

/// One validation run of one candidate module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: SandboxId,
    pub module_id: String,
    pub status: SandboxStatus,
    pub resources: ResourceUsage,
    pub violations: Vec<SecurityViolation>,
    pub test_results: Vec<TestResult>,
    pub performance: Performance,
}

/// A candidate module submitted for validation and promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateModule {
    pub id: String,
    pub name: String,
    pub source_code: String,
    #[serde(default)]
    pub test_scenarios: Vec<TestScenario>,
}

impl CandidateModule {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        source_code: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source_code: source_code.into(),
            test_scenarios: Vec::new(),
        }
    }

    /// Append a scenario and return `self` (builder pattern).
    pub fn with_scenario(mut self, scenario: TestScenario) -> Self {
        self.test_scenarios.push(scenario);
        self
    }
}

/// Per-sandbox overrides applied on top of the capability policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxOptions {
    pub timeout_ms: Option<u64>,
    pub max_memory_bytes: Option<u64>,
    pub max_cpu_percent: Option<f64>,
}
