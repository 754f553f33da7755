use thiserror::Error;

use crate::sandbox::SandboxError;

use super::phase::UpgradePhase;

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("collaborator rejected request: {0}")]
    Rejected(String),
}

/// Why a single workflow phase failed.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("prerequisites not met: {0}")]
    Prerequisites(String),

    #[error("learning failed for module {module_id}: {reason}")]
    Learning { module_id: String, reason: String },

    #[error("sandbox testing stalled; {pending} module(s) without a verdict")]
    SandboxStalled { pending: usize },

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("health score {score:.2} below threshold {threshold:.2}")]
    ValidationFailed { score: f64, threshold: f64 },

    #[error("deployment of module {module_id} failed: {reason}")]
    Deployment { module_id: String, reason: String },

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// A per-module task panicked or was cancelled.
    #[error("task for module {module_id} failed: {reason}")]
    TaskFailed { module_id: String, reason: String },
}

/// Errors returned by the upgrade orchestrator.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// Another upgrade holds the in-flight flag.
    #[error("an upgrade is already in progress")]
    Busy,

    #[error("invalid upgrade config: {0}")]
    InvalidConfig(String),

    /// A phase failed and the workflow was rolled back.
    #[error("upgrade failed in phase {phase}: {source}")]
    PhaseFailed {
        phase: UpgradePhase,
        #[source]
        source: PhaseError,
        /// Set when restoring the backup also failed.
        rollback_failure: Option<String>,
    },
}

impl UpgradeError {
    pub fn failed_phase(&self) -> Option<UpgradePhase> {
        match self {
            UpgradeError::PhaseFailed { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

pub type UpgradeResult<T> = std::result::Result<T, UpgradeError>;
