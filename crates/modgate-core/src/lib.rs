//! modgate core library
//!
//! Validates untrusted candidate modules in screened, isolated sandboxes and
//! promotes the ones that pass into a live system through a rollback-capable
//! upgrade workflow.

pub mod config;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod sandbox;
pub mod telemetry;
pub mod upgrade;

pub use config::{ConfigError, ModgateConfig};

pub use sandbox::{
    CandidateModule, Capability, CapabilityPolicy, ExecContext, ExecError, Executor, FnExecutor,
    IsolatedEnvironment, NetworkIsolation, PatternPolicy, Policy, PolicyRule, ProcessExecutor, Readiness, RiskLevel,
    SandboxController, SandboxError, SandboxId, SandboxOptions, SandboxResult, SandboxSettings,
    SandboxStatus, ScoringConfig, SecurityViolation, Severity, TestResult, TestScenario, Verdict,
    VerdictKind,
};

pub use upgrade::{
    spawn_scheduler, Artifact, Backup, CollaboratorError, HealthReport,
    KnowledgeIntegrationCollaborator, LearningCollaborator, LiveSystem, Optimizable,
    OrchestratorConfig, PhaseError, UpgradeConfig, UpgradeError, UpgradeOrchestrator,
    UpgradePhase, UpgradePriority, UpgradeReport, UpgradeResult, UpgradeStatus, UpgradeSummary,
};

pub use metrics::METRICS;
pub use telemetry::init_tracing;

/// modgate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
