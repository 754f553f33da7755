//! Error types for the sandbox module.

use super::model::{SandboxId, SandboxStatus};

/// Errors raised by the isolated execution environment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvironmentError {
    #[error("capability not granted: {capability}")]
    PermissionDenied { capability: String },

    #[error("timer delay {requested_ms}ms exceeds ceiling {max_ms}ms")]
    DelayTooLong { requested_ms: u64, max_ms: u64 },

    #[error("interval {requested_ms}ms is below floor {min_ms}ms")]
    IntervalTooShort { requested_ms: u64, min_ms: u64 },

    #[error("invalid virtual path: {0}")]
    InvalidPath(String),

    #[error("no such virtual file: {0}")]
    FileNotFound(String),

    #[error("environment has been released")]
    Released,
}

/// Errors produced by the sandbox layer.
///
/// Per-execution failures (policy refusal, timeout, runtime errors) are not
/// errors here; they are carried as data in a [`Verdict`](super::verdict::Verdict).
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox capacity exhausted: {active} active (max {max})")]
    ResourceExhausted { active: usize, max: usize },

    #[error("sandbox not found: {0}")]
    NotFound(SandboxId),

    #[error("invalid sandbox transition {from} -> {to}")]
    InvalidTransition {
        from: SandboxStatus,
        to: SandboxStatus,
    },

    #[error("environment error: {0}")]
    Environment(#[from] EnvironmentError),
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
