//! Aggregate health over a job's sandbox verdicts.

use serde::{Deserialize, Serialize};

use crate::sandbox::{Readiness, Verdict};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleHealth {
    pub module_id: String,
    pub contribution: f64,
    pub readiness: Readiness,
    pub failed: bool,
}

/// Health of all modules in one upgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub modules: Vec<ModuleHealth>,
    /// Mean contribution in [0, 1]; 0 when there are no verdicts.
    pub score: f64,
}

impl HealthReport {
    pub fn from_verdicts<'a>(verdicts: impl IntoIterator<Item = &'a Verdict>) -> Self {
        let modules: Vec<ModuleHealth> = verdicts
            .into_iter()
            .map(|v| ModuleHealth {
                module_id: v.module_id.clone(),
                contribution: v.health_contribution(),
                readiness: v.readiness,
                failed: v.is_failure(),
            })
            .collect();
        let score = if modules.is_empty() {
            0.0
        } else {
            modules.iter().map(|m| m.contribution).sum::<f64>() / modules.len() as f64
        };
        Self { modules, score }
    }

    pub fn passes(&self, threshold: f64) -> bool {
        self.score >= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{
        Performance, RiskLevel, SandboxId, SecurityReport, VerdictKind,
    };

    fn verdict(module_id: &str, kind: VerdictKind, score: f64) -> Verdict {
        Verdict {
            sandbox_id: SandboxId::new(),
            module_id: module_id.into(),
            kind,
            score,
            readiness: Readiness::Ready,
            output: None,
            issues: vec![],
            recommendations: vec![],
            security: SecurityReport {
                violations: vec![],
                risk_level: RiskLevel::Low,
            },
            test_results: vec![],
            performance: Performance {
                started_at: chrono::Utc::now(),
                ended_at: None,
                duration_ms: None,
            },
        }
    }

    #[test]
    fn test_failed_verdicts_contribute_zero() {
        let a = verdict("a", VerdictKind::Completed, 100.0);
        let b = verdict("b", VerdictKind::SecurityViolation, 85.0);
        let report = HealthReport::from_verdicts([&a, &b]);
        assert_eq!(report.score, 0.5);
        assert!(!report.passes(0.8));
        assert!(report.modules[1].failed);
    }

    #[test]
    fn test_empty_report_scores_zero() {
        let report = HealthReport::from_verdicts(std::iter::empty::<&Verdict>());
        assert_eq!(report.score, 0.0);
    }

    #[test]
    fn test_all_healthy_passes() {
        let a = verdict("a", VerdictKind::Completed, 90.0);
        let b = verdict("b", VerdictKind::Completed, 80.0);
        assert!(HealthReport::from_verdicts([&a, &b]).passes(0.8));
    }
}
