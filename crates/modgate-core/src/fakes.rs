//! In-memory collaborators for tests and the standalone daemon.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;

use crate::upgrade::{
    Artifact, Backup, CollaboratorError, CollaboratorResult, KnowledgeIntegrationCollaborator,
    LearningCollaborator, LiveSystem, Optimizable, SessionHandle,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Live system that keeps its active module set in memory.
#[derive(Debug, Default)]
pub struct MemoryLiveSystem {
    active: Mutex<Vec<String>>,
    activated: Mutex<Vec<Artifact>>,
    snapshots: AtomicUsize,
    restores: AtomicUsize,
    prerequisites_fail: AtomicBool,
    restore_fails: AtomicBool,
    activate_fails: AtomicBool,
}

impl MemoryLiveSystem {
    pub fn with_active(modules: Vec<String>) -> Self {
        Self {
            active: Mutex::new(modules),
            ..Default::default()
        }
    }

    pub fn fail_prerequisites(&self, fail: bool) {
        self.prerequisites_fail.store(fail, Ordering::SeqCst);
    }

    pub fn fail_restore(&self, fail: bool) {
        self.restore_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_activate(&self, fail: bool) {
        self.activate_fails.store(fail, Ordering::SeqCst);
    }

    pub fn active_modules(&self) -> Vec<String> {
        lock(&self.active).clone()
    }

    pub fn activated(&self) -> Vec<Artifact> {
        lock(&self.activated).clone()
    }

    pub fn restore_count(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LiveSystem for MemoryLiveSystem {
    async fn check_prerequisites(&self) -> CollaboratorResult<()> {
        if self.prerequisites_fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("live system offline".into()));
        }
        Ok(())
    }

    async fn snapshot(&self) -> CollaboratorResult<Backup> {
        let n = self.snapshots.fetch_add(1, Ordering::SeqCst);
        Ok(Backup {
            id: format!("backup-{n}"),
            taken_at: Utc::now(),
            active_modules: self.active_modules(),
        })
    }

    async fn restore(&self, backup: &Backup) -> CollaboratorResult<()> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        if self.restore_fails.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Rejected(format!(
                "cannot restore {}",
                backup.id
            )));
        }
        *lock(&self.active) = backup.active_modules.clone();
        lock(&self.activated).clear();
        Ok(())
    }

    async fn activate(&self, artifact: &Artifact) -> CollaboratorResult<()> {
        if self.activate_fails.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Rejected(format!(
                "activation of {} refused",
                artifact.module_id
            )));
        }
        lock(&self.activated).push(artifact.clone());
        Ok(())
    }

    async fn update_configuration(&self, module_ids: &[String]) -> CollaboratorResult<()> {
        let mut active = lock(&self.active);
        for id in module_ids {
            if !active.contains(id) {
                active.push(id.clone());
            }
        }
        Ok(())
    }
}

/// Learner that records which modules it was asked about.
#[derive(Debug, Default)]
pub struct RecordingLearner {
    started: Mutex<Vec<String>>,
    refreshes: AtomicUsize,
    failing_module: Option<String>,
    delay: Duration,
}

impl RecordingLearner {
    /// Fail `start_learning` for `module_id`.
    pub fn failing_for(module_id: impl Into<String>) -> Self {
        Self {
            failing_module: Some(module_id.into()),
            ..Default::default()
        }
    }

    /// Sleep for `delay` inside every `start_learning` call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn started(&self) -> Vec<String> {
        lock(&self.started).clone()
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LearningCollaborator for RecordingLearner {
    async fn start_learning(
        &self,
        module_id: &str,
        _data: &serde_json::Value,
    ) -> CollaboratorResult<SessionHandle> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing_module.as_deref() == Some(module_id) {
            return Err(CollaboratorError::Rejected(format!(
                "no training data for {module_id}"
            )));
        }
        lock(&self.started).push(module_id.to_string());
        Ok(SessionHandle {
            session_id: uuid::Uuid::new_v4().to_string(),
            module_id: module_id.to_string(),
        })
    }

    async fn refresh(&self) -> CollaboratorResult<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Integration backlog that shrinks by a fixed batch per drain.
#[derive(Debug)]
pub struct QueueIntegrator {
    pending: AtomicUsize,
    batch: usize,
    drains: AtomicUsize,
}

impl QueueIntegrator {
    pub fn new(pending: usize, batch: usize) -> Self {
        Self {
            pending: AtomicUsize::new(pending),
            batch,
            drains: AtomicUsize::new(0),
        }
    }

    pub fn drain_count(&self) -> usize {
        self.drains.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl KnowledgeIntegrationCollaborator for QueueIntegrator {
    async fn process_queue(&self) -> CollaboratorResult<()> {
        self.drains.fetch_add(1, Ordering::SeqCst);
        let batch = self.batch;
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                Some(p.saturating_sub(batch))
            });
        Ok(())
    }

    async fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Optimizer that counts its runs.
#[derive(Debug)]
pub struct CountingOptimizer {
    name: String,
    runs: AtomicUsize,
}

impl CountingOptimizer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Optimizable for CountingOptimizer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn optimize(&self) -> CollaboratorResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_restore_returns_to_snapshot() {
        let live = MemoryLiveSystem::with_active(vec!["base".into()]);
        let backup = live.snapshot().await.unwrap();
        live.update_configuration(&["new".into()]).await.unwrap();
        assert_eq!(live.active_modules(), vec!["base", "new"]);
        live.restore(&backup).await.unwrap();
        assert_eq!(live.active_modules(), vec!["base"]);
    }

    #[tokio::test]
    async fn test_integrator_drains_in_batches() {
        let q = QueueIntegrator::new(5, 2);
        q.process_queue().await.unwrap();
        assert_eq!(q.pending().await, 3);
        q.process_queue().await.unwrap();
        q.process_queue().await.unwrap();
        assert_eq!(q.pending().await, 0);
        assert_eq!(q.drain_count(), 3);
    }
}
