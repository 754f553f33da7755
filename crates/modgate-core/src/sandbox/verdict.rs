//! Verdict scoring and readiness classification.
//!
//! Scoring is a pure function over counts so its monotonicity can be checked
//! independently of any execution. All weights live in [`ScoringConfig`].

use serde::{Deserialize, Serialize};

use super::model::{
    Performance, RiskLevel, SandboxId, SecurityViolation, TestResult,
};

/// Weights and thresholds for verdict scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub base_score: f64,
    pub error_penalty: f64,
    pub violation_penalty: f64,
    pub slow_penalty: f64,
    /// Executions longer than this are penalised (milliseconds).
    pub slow_threshold_ms: u64,
    /// Bonus awarded at a 100% test pass rate; scaled linearly below that.
    pub test_bonus: f64,
    pub ready_threshold: f64,
    pub needs_improvement_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base_score: 100.0,
            error_penalty: 20.0,
            violation_penalty: 15.0,
            slow_penalty: 10.0,
            slow_threshold_ms: 1_000,
            test_bonus: 20.0,
            ready_threshold: 90.0,
            needs_improvement_threshold: 70.0,
        }
    }
}

/// Counts a score is derived from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInputs {
    pub runtime_errors: usize,
    pub violations: usize,
    pub slow: bool,
    /// Fraction of scenarios passed, in [0, 1].
    pub pass_rate: f64,
}

impl ScoringConfig {
    /// Composite score clamped to [0, 100].
    pub fn score(&self, inputs: &ScoreInputs) -> f64 {
        let mut score = self.base_score;
        score -= self.error_penalty * inputs.runtime_errors as f64;
        score -= self.violation_penalty * inputs.violations as f64;
        if inputs.slow {
            score -= self.slow_penalty;
        }
        score += self.test_bonus * inputs.pass_rate.clamp(0.0, 1.0);
        score.clamp(0.0, 100.0)
    }

    pub fn readiness(&self, score: f64, risk: RiskLevel) -> Readiness {
        if score >= self.ready_threshold && risk == RiskLevel::Low {
            Readiness::Ready
        } else if score >= self.needs_improvement_threshold {
            Readiness::NeedsImprovement
        } else {
            Readiness::NotReady
        }
    }
}

/// Classification of a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    NeedsImprovement,
    NotReady,
}

/// How a sandbox run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    /// The candidate ran to completion (possibly with runtime errors).
    Completed,
    /// A high-severity rule matched; the candidate never ran.
    SecurityViolation,
    /// Execution exceeded the sandbox timeout.
    ExecutionTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityReport {
    pub violations: Vec<SecurityViolation>,
    pub risk_level: RiskLevel,
}

/// Structured result of one sandbox run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub sandbox_id: SandboxId,
    pub module_id: String,
    pub kind: VerdictKind,
    pub score: f64,
    pub readiness: Readiness,
    pub output: Option<serde_json::Value>,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub security: SecurityReport,
    pub test_results: Vec<TestResult>,
    pub performance: Performance,
}

impl Verdict {
    /// `true` for security refusals and timeouts.
    pub fn is_failure(&self) -> bool {
        self.kind != VerdictKind::Completed
    }

    /// This module's share of an aggregate health score, in [0, 1].
    ///
    /// Failed verdicts contribute nothing.
    pub fn health_contribution(&self) -> f64 {
        if self.is_failure() {
            0.0
        } else {
            self.score / 100.0
        }
    }

    pub fn pass_rate(&self) -> f64 {
        pass_rate(&self.test_results)
    }
}

pub(crate) fn pass_rate(results: &[TestResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    results.iter().filter(|r| r.passed).count() as f64 / results.len() as f64
}

/// Recommendations derived from what went wrong.
pub(crate) fn recommendations(
    kind: VerdictKind,
    inputs: &ScoreInputs,
    violations: &[SecurityViolation],
    scenario_count: usize,
) -> Vec<String> {
    let mut out = Vec::new();
    match kind {
        VerdictKind::SecurityViolation => {
            out.push("remove high-severity constructs before resubmitting".to_string())
        }
        VerdictKind::ExecutionTimeout => {
            out.push("reduce work done at load time or raise the sandbox timeout".to_string())
        }
        VerdictKind::Completed => {}
    }
    let mut seen = std::collections::BTreeSet::new();
    for v in violations {
        if seen.insert(v.pattern.as_str()) {
            out.push(format!("avoid `{}` ({})", v.pattern, v.capability));
        }
    }
    if inputs.runtime_errors > 0 {
        out.push("fix runtime errors reported on the captured console".to_string());
    }
    if inputs.slow {
        out.push("optimize execution time".to_string());
    }
    if kind == VerdictKind::Completed {
        if scenario_count == 0 {
            out.push("add test scenarios to earn the test bonus".to_string());
        } else if inputs.pass_rate < 1.0 {
            out.push("fix failing test scenarios".to_string());
        }
    }
    out
}
