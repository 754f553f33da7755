//! Interfaces to the systems an upgrade talks to.
//!
//! The learning and knowledge-integration subsystems and the live deployment
//! target are external; the orchestrator only sees these traits. In-memory
//! implementations live in [`crate::fakes`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::CollaboratorError;
use crate::sandbox::{CandidateModule, Verdict};

pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

/// Handle to a learning session started for one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub session_id: String,
    pub module_id: String,
}

#[async_trait::async_trait]
pub trait LearningCollaborator: Send + Sync {
    async fn start_learning(
        &self,
        module_id: &str,
        data: &serde_json::Value,
    ) -> CollaboratorResult<SessionHandle>;

    /// Periodic refresh triggered by scheduler maintenance.
    async fn refresh(&self) -> CollaboratorResult<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
pub trait KnowledgeIntegrationCollaborator: Send + Sync {
    /// Process as much of the integration backlog as is ready.
    async fn process_queue(&self) -> CollaboratorResult<()>;

    /// Items still waiting for integration.
    async fn pending(&self) -> usize;
}

/// Opaque rollback point taken before anything is changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub taken_at: DateTime<Utc>,
    pub active_modules: Vec<String>,
}

/// A validated module ready for activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub module_id: String,
    pub name: String,
    pub source_code: String,
    /// Hex SHA-256 of `source_code`.
    pub digest: String,
    pub score: f64,
}

impl Artifact {
    pub fn from_verdict(module: &CandidateModule, verdict: &Verdict) -> Self {
        Self {
            module_id: module.id.clone(),
            name: module.name.clone(),
            source_code: module.source_code.clone(),
            digest: source_digest(&module.source_code),
            score: verdict.score,
        }
    }
}

/// Hex-encoded SHA-256 of module source.
pub fn source_digest(source: &str) -> String {
    hex::encode(Sha256::digest(source.as_bytes()))
}

/// The live system modules are deployed into.
#[async_trait::async_trait]
pub trait LiveSystem: Send + Sync {
    async fn check_prerequisites(&self) -> CollaboratorResult<()>;

    async fn snapshot(&self) -> CollaboratorResult<Backup>;

    async fn restore(&self, backup: &Backup) -> CollaboratorResult<()>;

    async fn activate(&self, artifact: &Artifact) -> CollaboratorResult<()>;

    async fn update_configuration(&self, module_ids: &[String]) -> CollaboratorResult<()>;
}

/// A component that can tidy itself up after an upgrade.
#[async_trait::async_trait]
pub trait Optimizable: Send + Sync {
    fn name(&self) -> &str;

    async fn optimize(&self) -> CollaboratorResult<()>;
}
