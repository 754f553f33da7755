//! Structured observability hooks for sandbox and upgrade lifecycle events.
//!
//! Events are emitted with an `event = "..."` field so log pipelines can
//! filter on them regardless of the output format.

use tracing::{error, info, warn};

use crate::sandbox::{SandboxId, Verdict};
use crate::upgrade::UpgradePhase;

/// Span covering one upgrade job; attach with `tracing::Instrument`.
pub fn job_span(job_id: &str) -> tracing::Span {
    tracing::info_span!("modgate.upgrade", job_id = %job_id)
}

pub fn emit_sandbox_created(sandbox_id: &SandboxId, module_id: &str, active: usize) {
    info!(
        event = "sandbox.created",
        sandbox_id = %sandbox_id,
        module_id = %module_id,
        active = active,
    );
}

/// Emit event: a sandbox run produced a verdict.
pub fn emit_verdict(verdict: &Verdict) {
    if verdict.is_failure() {
        warn!(
            event = "sandbox.verdict",
            sandbox_id = %verdict.sandbox_id,
            module_id = %verdict.module_id,
            kind = ?verdict.kind,
            score = verdict.score,
            issues = verdict.issues.len(),
        );
    } else {
        info!(
            event = "sandbox.verdict",
            sandbox_id = %verdict.sandbox_id,
            module_id = %verdict.module_id,
            kind = ?verdict.kind,
            score = verdict.score,
            readiness = ?verdict.readiness,
            pass_rate = verdict.pass_rate(),
        );
    }
}

pub fn emit_upgrade_started(job_id: &str, modules: usize) {
    info!(event = "upgrade.started", job_id = %job_id, modules = modules);
}

pub fn emit_phase_entered(job_id: &str, phase: UpgradePhase, progress: u8) {
    info!(
        event = "upgrade.phase",
        job_id = %job_id,
        phase = %phase,
        progress = progress,
    );
}

/// Emit event: upgrade finished.
pub fn emit_upgrade_finished(job_id: &str, duration_ms: u64, success: bool) {
    info!(
        event = "upgrade.finished",
        job_id = %job_id,
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_upgrade_failed(job_id: &str, phase: UpgradePhase, error: &dyn std::fmt::Display) {
    warn!(event = "upgrade.failed", job_id = %job_id, phase = %phase, error = %error);
}

/// Emit event: restoring the pre-deployment backup failed (error level).
pub fn emit_rollback_error(job_id: &str, error: &dyn std::fmt::Display) {
    error!(event = "upgrade.rollback_error", job_id = %job_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_span_create() {
        let span = job_span("job-1");
        let _entered = span.enter();
        emit_upgrade_started("job-1", 2);
    }
}
