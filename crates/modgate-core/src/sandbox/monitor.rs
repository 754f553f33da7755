//! Periodic memory/CPU sampling for one running sandbox.
//!
//! The monitor loop watches the sandbox status channel and exits on its own
//! as soon as the sandbox reaches a terminal state (or the channel closes),
//! so it never outlives the sandbox it samples.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::environment::IsolatedEnvironment;
use super::model::{ResourceUsage, SandboxId, SandboxStatus};
use crate::metrics::METRICS;

/// One memory/CPU reading.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub memory_bytes: u64,
    pub cpu_percent: f64,
}

/// Source of resource readings for a sandbox.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self, env: &IsolatedEnvironment) -> ResourceSample;
}

/// Reads what the environment accounts for itself plus, on Linux, the
/// resident set of an attached child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvironmentProbe;

impl EnvironmentProbe {
    fn child_rss_bytes(pid: u32) -> Option<u64> {
        let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * 4096)
    }
}

impl ResourceProbe for EnvironmentProbe {
    fn sample(&self, env: &IsolatedEnvironment) -> ResourceSample {
        let child = env
            .attached_pid()
            .and_then(Self::child_rss_bytes)
            .unwrap_or(0);
        ResourceSample {
            memory_bytes: env.accounted_bytes() + child,
            cpu_percent: env.reported_cpu_percent(),
        }
    }
}

/// Limits a sample is compared against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub max_memory_bytes: u64,
    pub max_cpu_percent: f64,
}

impl ResourceLimits {
    fn exceeded_by(&self, sample: &ResourceSample) -> bool {
        sample.memory_bytes > self.max_memory_bytes || sample.cpu_percent > self.max_cpu_percent
    }
}

/// Handle to a running monitor loop.
#[derive(Debug)]
pub struct ResourceMonitor {
    handle: JoinHandle<()>,
}

impl ResourceMonitor {
    /// Start sampling `env` every `interval` into `usage`.
    ///
    /// `usage` is the only write path to a sandbox's resource record.
    pub fn spawn(
        sandbox_id: SandboxId,
        env: Arc<IsolatedEnvironment>,
        probe: Arc<dyn ResourceProbe>,
        limits: ResourceLimits,
        interval: Duration,
        usage: Arc<RwLock<ResourceUsage>>,
        mut status: watch::Receiver<SandboxStatus>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                if status.borrow().is_terminal() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {
                        let sample = probe.sample(&env);
                        record_sample(sandbox_id, &usage, &limits, sample).await;
                    }
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(event = "sandbox.monitor_stopped", sandbox_id = %sandbox_id);
        });
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the loop if it has not already stopped itself.
    pub fn stop(&self) {
        if !self.handle.is_finished() {
            self.handle.abort();
        }
    }
}

async fn record_sample(
    sandbox_id: SandboxId,
    usage: &RwLock<ResourceUsage>,
    limits: &ResourceLimits,
    sample: ResourceSample,
) {
    let mut usage = usage.write().await;
    usage.memory_bytes = sample.memory_bytes;
    usage.peak_memory_bytes = usage.peak_memory_bytes.max(sample.memory_bytes);
    usage.cpu_percent = sample.cpu_percent;
    usage.samples += 1;

    if limits.exceeded_by(&sample) {
        usage.threshold_breaches += 1;
        METRICS.inc_threshold_breaches();
        warn!(
            event = "sandbox.threshold_exceeded",
            sandbox_id = %sandbox_id,
            memory_bytes = sample.memory_bytes,
            max_memory_bytes = limits.max_memory_bytes,
            cpu_percent = sample.cpu_percent,
            max_cpu_percent = limits.max_cpu_percent,
        );
    }
}
