//! The restricted surface a candidate module may observe.
//!
//! An [`IsolatedEnvironment`] owns a captured console, bounded timers and an
//! in-memory filesystem namespace. Nothing here touches real stdio or the
//! real filesystem; timers are tokio tasks that are aborted on release.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::capability::{Capability, CapabilityPolicy};
use super::error::EnvironmentError;
use super::model::SandboxId;

type EnvResult<T> = std::result::Result<T, EnvironmentError>;

/// Console stream a line was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleLevel {
    Log,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub level: ConsoleLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Snapshot of everything written to the captured console.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedConsole {
    pub lines: Vec<ConsoleLine>,
}

impl CapturedConsole {
    pub fn errors(&self) -> impl Iterator<Item = &ConsoleLine> {
        self.lines.iter().filter(|l| l.level == ConsoleLevel::Error)
    }

    pub fn error_count(&self) -> usize {
        self.errors().count()
    }
}

/// Handle to a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Restricted execution surface for one sandbox.
#[derive(Debug)]
pub struct IsolatedEnvironment {
    sandbox_id: SandboxId,
    policy: CapabilityPolicy,
    console: Mutex<Vec<ConsoleLine>>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    timers: Mutex<HashMap<TimerId, JoinHandle<()>>>,
    next_timer: AtomicU64,
    accounted_bytes: AtomicU64,
    reported_cpu_millis: AtomicU64,
    attached_pid: AtomicU64,
    released: AtomicBool,
}

// Poisoning only means a candidate callback panicked mid-write; the buffers
// are still structurally valid.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl IsolatedEnvironment {
    pub fn new(sandbox_id: SandboxId, policy: CapabilityPolicy) -> Self {
        Self {
            sandbox_id,
            policy,
            console: Mutex::new(Vec::new()),
            files: Mutex::new(BTreeMap::new()),
            timers: Mutex::new(HashMap::new()),
            next_timer: AtomicU64::new(1),
            accounted_bytes: AtomicU64::new(0),
            reported_cpu_millis: AtomicU64::new(0),
            attached_pid: AtomicU64::new(0),
            released: AtomicBool::new(false),
        }
    }

    pub fn sandbox_id(&self) -> SandboxId {
        self.sandbox_id
    }

    pub fn policy(&self) -> &CapabilityPolicy {
        &self.policy
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> EnvResult<()> {
        if self.is_released() {
            return Err(EnvironmentError::Released);
        }
        Ok(())
    }

    /// Fail unless `capability` is granted by the policy.
    pub fn require(&self, capability: &Capability) -> EnvResult<()> {
        self.ensure_live()?;
        if self.policy.allows(capability) {
            Ok(())
        } else {
            Err(EnvironmentError::PermissionDenied {
                capability: capability.to_string(),
            })
        }
    }

    pub fn check_network(&self) -> EnvResult<()> {
        self.require(&Capability::Network)
    }

    /// `true` when `name` is a whitelisted global (or host globals are granted).
    pub fn has_global(&self, name: &str) -> bool {
        !self.is_released()
            && (self.policy.globals.contains(name)
                || self.policy.allows(&Capability::HostGlobals))
    }

    // ---------------------------------------------------------------------
    // Console
    // ---------------------------------------------------------------------

    fn write_console(&self, level: ConsoleLevel, message: impl Into<String>) -> EnvResult<()> {
        self.require(&Capability::Console)?;
        let message = message.into();
        self.accounted_bytes
            .fetch_add(message.len() as u64, Ordering::Relaxed);
        lock(&self.console).push(ConsoleLine {
            level,
            message,
            at: Utc::now(),
        });
        Ok(())
    }

    pub fn log(&self, message: impl Into<String>) -> EnvResult<()> {
        self.write_console(ConsoleLevel::Log, message)
    }

    pub fn warn(&self, message: impl Into<String>) -> EnvResult<()> {
        self.write_console(ConsoleLevel::Warn, message)
    }

    pub fn error(&self, message: impl Into<String>) -> EnvResult<()> {
        self.write_console(ConsoleLevel::Error, message)
    }

    pub fn captured(&self) -> CapturedConsole {
        CapturedConsole {
            lines: lock(&self.console).clone(),
        }
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    /// Run `callback` once after `delay`. Delays above the policy ceiling are
    /// refused.
    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> EnvResult<TimerId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.require(&Capability::Timers)?;
        let requested_ms = delay.as_millis() as u64;
        if requested_ms > self.policy.max_timer_delay_ms {
            return Err(EnvironmentError::DelayTooLong {
                requested_ms,
                max_ms: self.policy.max_timer_delay_ms,
            });
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        self.track_timer(handle)
    }

    /// Run `callback` every `period`. Periods below the policy floor are
    /// refused.
    pub fn set_interval<F>(&self, period: Duration, mut callback: F) -> EnvResult<TimerId>
    where
        F: FnMut() + Send + 'static,
    {
        self.require(&Capability::Timers)?;
        let requested_ms = period.as_millis() as u64;
        if requested_ms < self.policy.min_interval_ms {
            return Err(EnvironmentError::IntervalTooShort {
                requested_ms,
                min_ms: self.policy.min_interval_ms,
            });
        }
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                callback();
            }
        });
        self.track_timer(handle)
    }

    fn track_timer(&self, handle: JoinHandle<()>) -> EnvResult<TimerId> {
        let mut timers = lock(&self.timers);
        // `release` may have drained the table since `require` passed.
        if self.is_released() {
            handle.abort();
            return Err(EnvironmentError::Released);
        }
        let id = TimerId(self.next_timer.fetch_add(1, Ordering::Relaxed));
        timers.retain(|_, h| !h.is_finished());
        timers.insert(id, handle);
        Ok(id)
    }

    /// Cancel a timer. Unknown or already-fired ids are ignored.
    pub fn clear_timer(&self, id: TimerId) {
        if let Some(handle) = lock(&self.timers).remove(&id) {
            handle.abort();
        }
    }

    pub fn active_timers(&self) -> usize {
        lock(&self.timers)
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    // ---------------------------------------------------------------------
    // Virtual filesystem
    // ---------------------------------------------------------------------

    fn normalize(path: &str) -> EnvResult<String> {
        let mut parts = Vec::new();
        for part in path.split('/') {
            match part {
                "" | "." => continue,
                ".." => return Err(EnvironmentError::InvalidPath(path.to_string())),
                p if p.contains('\0') => {
                    return Err(EnvironmentError::InvalidPath(path.to_string()))
                }
                p => parts.push(p),
            }
        }
        if parts.is_empty() {
            return Err(EnvironmentError::InvalidPath(path.to_string()));
        }
        Ok(format!("/{}", parts.join("/")))
    }

    pub fn write_file(&self, path: &str, contents: impl Into<Vec<u8>>) -> EnvResult<()> {
        self.require(&Capability::VirtualFs)?;
        let key = Self::normalize(path)?;
        let contents = contents.into();
        let added = contents.len() as u64;
        let previous = lock(&self.files).insert(key, contents);
        let removed = previous.map(|p| p.len() as u64).unwrap_or(0);
        self.adjust_accounted(added, removed);
        Ok(())
    }

    pub fn read_file(&self, path: &str) -> EnvResult<Vec<u8>> {
        self.require(&Capability::VirtualFs)?;
        let key = Self::normalize(path)?;
        lock(&self.files)
            .get(&key)
            .cloned()
            .ok_or(EnvironmentError::FileNotFound(key))
    }

    pub fn file_exists(&self, path: &str) -> EnvResult<bool> {
        self.require(&Capability::VirtualFs)?;
        let key = Self::normalize(path)?;
        Ok(lock(&self.files).contains_key(&key))
    }

    pub fn remove_file(&self, path: &str) -> EnvResult<()> {
        self.require(&Capability::VirtualFs)?;
        let key = Self::normalize(path)?;
        match lock(&self.files).remove(&key) {
            Some(old) => {
                self.adjust_accounted(0, old.len() as u64);
                Ok(())
            }
            None => Err(EnvironmentError::FileNotFound(key)),
        }
    }

    /// Paths under `prefix` in lexicographic order.
    pub fn list_files(&self, prefix: &str) -> EnvResult<Vec<String>> {
        self.require(&Capability::VirtualFs)?;
        let files = lock(&self.files);
        if prefix.trim_matches('/').is_empty() {
            return Ok(files.keys().cloned().collect());
        }
        let dir = Self::normalize(prefix)?;
        let nested = format!("{dir}/");
        Ok(files
            .keys()
            .filter(|k| **k == dir || k.starts_with(&nested))
            .cloned()
            .collect())
    }

    fn adjust_accounted(&self, added: u64, removed: u64) {
        if added >= removed {
            self.accounted_bytes
                .fetch_add(added - removed, Ordering::Relaxed);
        } else {
            let delta = removed - added;
            let _ = self
                .accounted_bytes
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                    Some(cur.saturating_sub(delta))
                });
        }
    }

    // ---------------------------------------------------------------------
    // Resource reporting
    // ---------------------------------------------------------------------

    /// Bytes currently held by the console buffers and virtual filesystem.
    pub fn accounted_bytes(&self) -> u64 {
        self.accounted_bytes.load(Ordering::Relaxed)
    }

    /// Executors report CPU utilisation of the candidate here.
    pub fn report_cpu_percent(&self, percent: f64) {
        let millis = (percent.max(0.0) * 1000.0) as u64;
        self.reported_cpu_millis.store(millis, Ordering::Relaxed);
    }

    pub fn reported_cpu_percent(&self) -> f64 {
        self.reported_cpu_millis.load(Ordering::Relaxed) as f64 / 1000.0
    }

    /// Executors that spawn a child process attach its pid for sampling.
    pub fn attach_pid(&self, pid: Option<u32>) {
        self.attached_pid
            .store(pid.map(u64::from).unwrap_or(0), Ordering::Relaxed);
    }

    pub fn attached_pid(&self) -> Option<u32> {
        match self.attached_pid.load(Ordering::Relaxed) {
            0 => None,
            pid => u32::try_from(pid).ok(),
        }
    }

    /// Abort timers and drop all buffered state. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        for (_, handle) in lock(&self.timers).drain() {
            handle.abort();
        }
        lock(&self.files).clear();
        lock(&self.console).clear();
        self.accounted_bytes.store(0, Ordering::Relaxed);
        self.attached_pid.store(0, Ordering::Relaxed);
    }
}

impl Drop for IsolatedEnvironment {
    fn drop(&mut self) {
        for (_, handle) in lock(&self.timers).drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn env() -> IsolatedEnvironment {
        IsolatedEnvironment::new(SandboxId::new(), CapabilityPolicy::default())
    }

    #[test]
    fn test_console_is_captured_per_environment() {
        let a = env();
        let b = env();
        a.log("hello").unwrap();
        a.error("boom").unwrap();
        b.warn("other").unwrap();

        let captured = a.captured();
        assert_eq!(captured.lines.len(), 2);
        assert_eq!(captured.error_count(), 1);
        assert_eq!(b.captured().lines.len(), 1);
        assert_eq!(a.accounted_bytes(), 9);
    }

    #[test]
    fn test_virtual_fs_roundtrip_and_accounting() {
        let e = env();
        e.write_file("data/config.json", b"{}".to_vec()).unwrap();
        assert!(e.file_exists("/data/config.json").unwrap());
        assert_eq!(e.read_file("/data/./config.json").unwrap(), b"{}");
        assert_eq!(e.list_files("/data").unwrap(), vec!["/data/config.json"]);
        assert_eq!(e.accounted_bytes(), 2);

        e.write_file("/data/config.json", b"{\"a\":1}".to_vec()).unwrap();
        assert_eq!(e.accounted_bytes(), 7);
        e.remove_file("/data/config.json").unwrap();
        assert_eq!(e.accounted_bytes(), 0);
        assert!(matches!(
            e.read_file("/data/config.json"),
            Err(EnvironmentError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_virtual_fs_refuses_traversal() {
        let e = env();
        assert!(matches!(
            e.write_file("../etc/passwd", b"x".to_vec()),
            Err(EnvironmentError::InvalidPath(_))
        ));
        assert!(matches!(
            e.read_file("/"),
            Err(EnvironmentError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_network_and_host_globals_denied_by_default() {
        let e = env();
        assert!(matches!(
            e.check_network(),
            Err(EnvironmentError::PermissionDenied { .. })
        ));
        assert!(e.has_global("JSON"));
        assert!(!e.has_global("process"));
    }

    #[test]
    fn test_vfs_denied_without_capability() {
        let mut policy = CapabilityPolicy::default();
        policy.granted.remove(&Capability::VirtualFs);
        let e = IsolatedEnvironment::new(SandboxId::new(), policy);
        assert!(matches!(
            e.write_file("/a", b"x".to_vec()),
            Err(EnvironmentError::PermissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_timer_bounds_are_enforced() {
        let e = env();
        let too_long = Duration::from_millis(e.policy().max_timer_delay_ms + 1);
        assert!(matches!(
            e.set_timeout(too_long, || {}),
            Err(EnvironmentError::DelayTooLong { .. })
        ));
        assert!(matches!(
            e.set_interval(Duration::from_millis(1), || {}),
            Err(EnvironmentError::IntervalTooShort { .. })
        ));
    }

    #[tokio::test]
    async fn test_set_timeout_fires_once() {
        let e = env();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        e.set_timeout(Duration::from_millis(10), move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_aborts_timers_and_blocks_further_use() {
        let e = env();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        e.set_interval(Duration::from_millis(100), move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        e.write_file("/x", b"abc".to_vec()).unwrap();
        assert_eq!(e.active_timers(), 1);

        e.release();
        e.release();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(e.accounted_bytes(), 0);
        assert!(matches!(e.log("late"), Err(EnvironmentError::Released)));
        assert!(!e.has_global("JSON"));
    }

    #[tokio::test]
    async fn test_timer_registered_after_release_is_aborted() {
        let e = env();
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            f.fetch_add(1, Ordering::SeqCst);
        });

        // The timer passed `require` before the environment was released.
        e.release();
        assert!(matches!(
            e.track_timer(handle),
            Err(EnvironmentError::Released)
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(e.active_timers(), 0);
    }

    #[test]
    fn test_cpu_and_pid_reporting() {
        let e = env();
        e.report_cpu_percent(42.5);
        assert!((e.reported_cpu_percent() - 42.5).abs() < 0.01);
        assert_eq!(e.attached_pid(), None);
        e.attach_pid(Some(1234));
        assert_eq!(e.attached_pid(), Some(1234));
    }
}
