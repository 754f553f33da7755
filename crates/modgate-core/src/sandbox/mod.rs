//! Sandbox: screened, isolated, monitored execution of candidate modules.
//!
//! Candidate source is screened by a pattern policy before it ever runs.
//! Anything that passes executes inside a capability-restricted environment
//! under a timeout while a monitor samples its resources. Each run ends in a
//! scored [`Verdict`].
//!
//! # Modules
//!
//! - [`capability`]  - `Capability` enum + `CapabilityPolicy` (grants, limits)
//! - [`policy`]      - `Policy` trait, `PolicyRule`, `PatternPolicy::standard()`
//! - [`environment`] - `IsolatedEnvironment` (console, timers, virtual fs)
//! - [`executor`]    - `Executor` trait, `FnExecutor`
//! - [`process`]     - `ProcessExecutor` (interpreter subprocess)
//! - [`monitor`]     - `ResourceMonitor`, `ResourceProbe`
//! - [`verdict`]     - `ScoringConfig`, `Verdict`, `Readiness`
//! - [`controller`]  - `SandboxController` (create / run / cleanup)
//! - [`model`]       - sandbox records and test scenarios
//! - [`error`]       - `SandboxError` / `SandboxResult`

pub mod capability;
pub mod controller;
pub mod environment;
pub mod error;
pub mod executor;
pub mod model;
pub mod monitor;
pub mod policy;
pub mod process;
pub mod verdict;

pub use capability::{Capability, CapabilityPolicy};
pub use controller::{SandboxController, SandboxSettings};
pub use environment::{CapturedConsole, ConsoleLevel, ConsoleLine, IsolatedEnvironment, TimerId};
pub use error::{EnvironmentError, SandboxError, SandboxResult};
pub use executor::{ExecContext, ExecError, Executor, FnExecutor};
pub use model::{
    CandidateModule, Performance, ResourceUsage, RiskLevel, Sandbox, SandboxId, SandboxOptions,
    SandboxStatus, SecurityViolation, Severity, TestResult, TestScenario,
};
pub use monitor::{EnvironmentProbe, ResourceLimits, ResourceMonitor, ResourceProbe, ResourceSample};
pub use policy::{PatternPolicy, Policy, PolicyRule};
pub use process::{NetworkIsolation, ProcessExecutor};
pub use verdict::{Readiness, ScoreInputs, ScoringConfig, SecurityReport, Verdict, VerdictKind};
