//! Upgrade orchestration: promote validated modules into a live system.
//!
//! A job moves through seven phases (preparation, background learning,
//! sandbox testing, integration, validation, deployment, cleanup). Any phase
//! error rolls the attempt back before it is reported.
//!
//! # Modules
//!
//! - [`phase`]         - `UpgradePhase` ordering and progress
//! - [`job`]           - `UpgradeConfig`, `UpgradeJob`, `JobQueue`
//! - [`collaborators`] - learning / integration / live-system traits
//! - [`health`]        - `HealthReport` over sandbox verdicts
//! - [`orchestrator`]  - `UpgradeOrchestrator` (start, schedule, status)
//! - [`scheduler`]     - `spawn_scheduler()`, maintenance pass
//! - [`error`]         - `UpgradeError` / `PhaseError`

pub mod collaborators;
pub mod error;
pub mod health;
pub mod job;
pub mod orchestrator;
pub mod phase;
pub mod scheduler;

pub use collaborators::{
    source_digest, Artifact, Backup, CollaboratorResult, KnowledgeIntegrationCollaborator,
    LearningCollaborator, LiveSystem, Optimizable, SessionHandle,
};
pub use error::{CollaboratorError, PhaseError, UpgradeError, UpgradeResult};
pub use health::{HealthReport, ModuleHealth};
pub use job::{JobQueue, UpgradeConfig, UpgradeJob, UpgradePriority};
pub use orchestrator::{
    OrchestratorConfig, UpgradeOrchestrator, UpgradeReport, UpgradeStatus, UpgradeSummary,
};
pub use phase::UpgradePhase;
pub use scheduler::{spawn_scheduler, MaintenanceOutcome, TickOutcome};
