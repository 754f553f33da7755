//! Sandbox capabilities and the static capability/resource policy.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// What a candidate may touch inside its environment.
///
/// `Custom(String)` is an escape hatch for embedder-specific capabilities.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Console,
    Timers,
    VirtualFs,
    Network,
    ProcessControl,
    HostGlobals,
    Custom(String),
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Console => write!(f, "console"),
            Capability::Timers => write!(f, "timers"),
            Capability::VirtualFs => write!(f, "virtual_fs"),
            Capability::Network => write!(f, "network"),
            Capability::ProcessControl => write!(f, "process_control"),
            Capability::HostGlobals => write!(f, "host_globals"),
            Capability::Custom(s) => write!(f, "custom({s})"),
        }
    }
}

/// Capability and resource policy applied to every sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityPolicy {
    /// Capabilities granted to candidate code.
    pub granted: BTreeSet<Capability>,
    /// Global names a candidate may reference.
    pub globals: BTreeSet<String>,
    /// Wall-clock budget for one execution (milliseconds).
    pub default_timeout_ms: u64,
    pub max_memory_bytes: u64,
    pub max_cpu_percent: f64,
    pub network_access: bool,
    /// Longest delay accepted by `set_timeout` (milliseconds).
    pub max_timer_delay_ms: u64,
    /// Shortest period accepted by `set_interval` (milliseconds).
    pub min_interval_ms: u64,
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        Self {
            granted: [Capability::Console, Capability::Timers, Capability::VirtualFs]
                .into_iter()
                .collect(),
            globals: [
                "Array", "Boolean", "Date", "JSON", "Math", "Number", "Object", "Promise",
                "String",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            default_timeout_ms: 5_000,
            max_memory_bytes: 128 * 1024 * 1024,
            max_cpu_percent: 80.0,
            network_access: false,
            max_timer_delay_ms: 5_000,
            min_interval_ms: 100,
        }
    }
}

impl CapabilityPolicy {
    /// Grant an additional capability and return `self` (builder pattern).
    pub fn with_capability(mut self, capability: Capability) -> Self {
        if capability == Capability::Network {
            self.network_access = true;
        }
        self.granted.insert(capability);
        self
    }

    pub fn allows(&self, capability: &Capability) -> bool {
        if *capability == Capability::Network {
            return self.network_access;
        }
        self.granted.contains(capability)
    }
}
