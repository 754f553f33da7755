//! Subprocess-backed executor.
//!
//! Runs an interpreter with the candidate source as its last argument, the
//! JSON input on stdin, and a cleared environment. Stdout/stderr are
//! captured into the sandbox console, never forwarded to the host's stdio.
//! The child is killed when the execution future is dropped, which is how
//! the controller's timeout race terminates it.
//!
//! A child process cannot see the environment's virtual filesystem, timer
//! bounds or `check_network`. What this executor does enforce: each child
//! starts in a fresh scratch directory that is removed afterwards, and when
//! the policy denies network access the child runs in its own network
//! namespace (or is not launched at all if no isolation is configured).
//! Absolute host paths stay readable; run the daemon inside a container or
//! chroot when candidates must not see the host filesystem.

use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::environment::IsolatedEnvironment;
use super::executor::{ExecError, Executor};

/// How a child is kept off the network when the policy denies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkIsolation {
    /// Nothing enforces it; candidates are refused unless network is allowed.
    #[default]
    None,
    /// Wrap the interpreter in `unshare --net --map-root-user` (Linux).
    Unshare,
    /// The host already runs without network (container, firewall).
    External,
}

impl FromStr for NetworkIsolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "unshare" => Ok(Self::Unshare),
            "external" => Ok(Self::External),
            other => Err(format!(
                "unknown network isolation `{other}` (expected none, unshare or external)"
            )),
        }
    }
}

/// Executor that launches one interpreter process per call.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    scratch_root: Option<PathBuf>,
    search_path: Option<String>,
    network: NetworkIsolation,
}

impl ProcessExecutor {
    /// `program args... <code>`; e.g. `ProcessExecutor::new("sh", ["-c"])`.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            scratch_root: None,
            search_path: None,
            network: NetworkIsolation::None,
        }
    }

    /// Parent directory for per-execution scratch directories (default: the
    /// system temp dir).
    pub fn with_scratch_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(dir.into());
        self
    }

    pub fn with_network_isolation(mut self, network: NetworkIsolation) -> Self {
        self.network = network;
        self
    }

    /// `PATH` exposed to the child; nothing else from the host leaks through.
    pub fn with_search_path(mut self, path: impl Into<String>) -> Self {
        self.search_path = Some(path.into());
        self
    }

    fn command(&self, network_allowed: bool) -> Result<Command, ExecError> {
        if network_allowed {
            let mut cmd = Command::new(&self.program);
            cmd.args(&self.args);
            return Ok(cmd);
        }
        match self.network {
            NetworkIsolation::None => Err(ExecError::Launch(
                "policy denies network access and no network isolation is configured".into(),
            )),
            NetworkIsolation::External => {
                let mut cmd = Command::new(&self.program);
                cmd.args(&self.args);
                Ok(cmd)
            }
            NetworkIsolation::Unshare => {
                let mut cmd = Command::new("unshare");
                cmd.args(["--net", "--map-root-user", "--"])
                    .arg(&self.program)
                    .args(&self.args);
                Ok(cmd)
            }
        }
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir, ExecError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("modgate-");
        let dir = match &self.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        };
        dir.map_err(|e| ExecError::Launch(format!("scratch dir: {e}")))
    }

    fn parse_output(stdout: &str) -> serde_json::Value {
        match stdout.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(last) => serde_json::from_str(last.trim())
                .unwrap_or_else(|_| serde_json::Value::String(last.trim().to_string())),
            None => serde_json::Value::Null,
        }
    }
}

#[async_trait::async_trait]
impl Executor for ProcessExecutor {
    async fn execute(
        &self,
        code: &str,
        input: &serde_json::Value,
        env: Arc<IsolatedEnvironment>,
    ) -> Result<serde_json::Value, ExecError> {
        let scratch = self.scratch_dir()?;
        let mut cmd = self.command(env.policy().network_access)?;
        cmd.arg(code)
            .current_dir(scratch.path())
            .env_clear()
            .env("HOME", scratch.path())
            .env("TMPDIR", scratch.path())
            .env("MODGATE_SANDBOX_ID", env.sandbox_id().to_string())
            .env(
                "MODGATE_NETWORK",
                if env.policy().network_access { "1" } else { "0" },
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = &self.search_path {
            cmd.env("PATH", path);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::Launch(format!("{}: {e}", self.program)))?;
        env.attach_pid(child.id());

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(input)
                .map_err(|e| ExecError::Launch(format!("encode input: {e}")))?;
            // A candidate that ignores stdin may exit before we finish writing.
            let _ = stdin.write_all(&payload).await;
        }

        let output = child.wait_with_output().await;
        env.attach_pid(None);
        let output = output.map_err(|e| ExecError::Launch(e.to_string()))?;
        if let Err(e) = scratch.close() {
            debug!(event = "sandbox.scratch_cleanup_failed", error = %e);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stdout.lines() {
            let _ = env.log(line);
        }
        for line in stderr.lines() {
            let _ = env.error(line);
        }

        debug!(
            event = "sandbox.process_exited",
            sandbox_id = %env.sandbox_id(),
            exit_code = output.status.code().unwrap_or(-1),
        );

        if !output.status.success() {
            // The first line carries the message; later lines are usually a trace.
            let reason = stderr
                .lines()
                .find(|l| !l.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("exit code {}", output.status.code().unwrap_or(-1)));
            return Err(ExecError::Runtime(reason));
        }

        Ok(Self::parse_output(&stdout))
    }
}
