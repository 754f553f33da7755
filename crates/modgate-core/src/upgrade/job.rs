//! Upgrade requests and the three-tier job queue.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::phase::UpgradePhase;
use crate::sandbox::CandidateModule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradePriority {
    High,
    #[default]
    Normal,
    Low,
}

/// What to upgrade and how.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpgradeConfig {
    pub modules: Vec<CandidateModule>,
    #[serde(default)]
    pub priority: UpgradePriority,
    /// Opaque payload handed to the learning collaborator for every module.
    #[serde(default)]
    pub learning_data: serde_json::Value,
    /// Overrides the orchestrator's health threshold for this job.
    #[serde(default)]
    pub health_threshold: Option<f64>,
}

impl UpgradeConfig {
    pub fn new(modules: Vec<CandidateModule>) -> Self {
        Self {
            modules,
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: UpgradePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn module_ids(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.id.clone()).collect()
    }
}

/// One queued or running upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeJob {
    pub id: Uuid,
    pub config: UpgradeConfig,
    pub priority: UpgradePriority,
    /// Last phase entered; `None` until the job starts.
    pub phase: Option<UpgradePhase>,
    pub scheduled_at: DateTime<Utc>,
}

impl UpgradeJob {
    pub fn new(config: UpgradeConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority: config.priority,
            config,
            phase: None,
            scheduled_at: Utc::now(),
        }
    }
}

/// Priority queue: high before normal before low, FIFO within a tier.
#[derive(Debug, Default)]
pub struct JobQueue {
    high: VecDeque<UpgradeJob>,
    normal: VecDeque<UpgradeJob>,
    low: VecDeque<UpgradeJob>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn tier(&mut self, priority: UpgradePriority) -> &mut VecDeque<UpgradeJob> {
        match priority {
            UpgradePriority::High => &mut self.high,
            UpgradePriority::Normal => &mut self.normal,
            UpgradePriority::Low => &mut self.low,
        }
    }

    pub fn push(&mut self, job: UpgradeJob) {
        self.tier(job.priority).push_back(job);
    }

    pub fn pop(&mut self) -> Option<UpgradeJob> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str, priority: UpgradePriority) -> UpgradeJob {
        let module = CandidateModule::new(name, name, "");
        UpgradeJob::new(UpgradeConfig::new(vec![module]).with_priority(priority))
    }

    #[test]
    fn test_queue_orders_by_tier_then_fifo() {
        let mut q = JobQueue::new();
        q.push(job("low-1", UpgradePriority::Low));
        q.push(job("normal-1", UpgradePriority::Normal));
        q.push(job("high-1", UpgradePriority::High));
        q.push(job("normal-2", UpgradePriority::Normal));
        q.push(job("high-2", UpgradePriority::High));
        assert_eq!(q.len(), 5);

        let order: Vec<String> = std::iter::from_fn(|| q.pop())
            .map(|j| j.config.modules[0].id.clone())
            .collect();
        assert_eq!(order, ["high-1", "high-2", "normal-1", "normal-2", "low-1"]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_config_priority_defaults_to_normal() {
        let cfg: UpgradeConfig = serde_json::from_str(r#"{"modules": []}"#).unwrap();
        assert_eq!(cfg.priority, UpgradePriority::Normal);
        assert!(cfg.health_threshold.is_none());
    }
}
