//! Global atomic counters for sandbox and upgrade observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of an upgrade or a scheduler tick).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    sandboxes_created: AtomicU64,
    sandboxes_refused: AtomicU64,
    violations_detected: AtomicU64,
    execution_timeouts: AtomicU64,
    threshold_breaches: AtomicU64,
    upgrades_succeeded: AtomicU64,
    upgrades_failed: AtomicU64,
    rollbacks: AtomicU64,
    rollback_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), "counter incremented");
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            sandboxes_created: AtomicU64::new(0),
            sandboxes_refused: AtomicU64::new(0),
            violations_detected: AtomicU64::new(0),
            execution_timeouts: AtomicU64::new(0),
            threshold_breaches: AtomicU64::new(0),
            upgrades_succeeded: AtomicU64::new(0),
            upgrades_failed: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            rollback_failures: AtomicU64::new(0),
        }
    }

    counter!(inc_sandboxes_created, sandboxes_created, sandboxes_created);
    counter!(inc_sandboxes_refused, sandboxes_refused, sandboxes_refused);
    counter!(inc_timeouts, execution_timeouts, execution_timeouts);
    counter!(inc_threshold_breaches, threshold_breaches, threshold_breaches);
    counter!(inc_upgrades_succeeded, upgrades_succeeded, upgrades_succeeded);
    counter!(inc_upgrades_failed, upgrades_failed, upgrades_failed);
    counter!(inc_rollbacks, rollbacks, rollbacks);
    counter!(inc_rollback_failures, rollback_failures, rollback_failures);

    /// Add `n` screened violations.
    pub fn add_violations(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.violations_detected.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "violations_detected", n, "counter incremented");
    }

    pub fn violations_detected(&self) -> u64 {
        self.violations_detected.load(Ordering::Relaxed)
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries rather than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            sandboxes_created = self.sandboxes_created(),
            sandboxes_refused = self.sandboxes_refused(),
            violations_detected = self.violations_detected(),
            execution_timeouts = self.execution_timeouts(),
            threshold_breaches = self.threshold_breaches(),
            upgrades_succeeded = self.upgrades_succeeded(),
            upgrades_failed = self.upgrades_failed(),
            rollbacks = self.rollbacks(),
            rollback_failures = self.rollback_failures(),
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for c in [
            &self.sandboxes_created,
            &self.sandboxes_refused,
            &self.violations_detected,
            &self.execution_timeouts,
            &self.threshold_breaches,
            &self.upgrades_succeeded,
            &self.upgrades_failed,
            &self.rollbacks,
            &self.rollback_failures,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}
