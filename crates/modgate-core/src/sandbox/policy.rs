//! Static screening of candidate source against a denylist of capabilities.
//!
//! [`PatternPolicy`] is the default [`Policy`]: an ordered table of regex
//! rules, each tagged with the capability it guards and a fixed severity.
//! Screening never invents rules; a violation is only ever produced by a
//! table entry.

use regex::Regex;

use super::capability::CapabilityPolicy;
use super::model::{SecurityViolation, Severity};

/// A source screener plus the capability policy it hands to environments.
pub trait Policy: Send + Sync {
    /// Report every rule match in `source`, in rule-table order.
    fn screen(&self, source: &str) -> Vec<SecurityViolation>;

    /// The capability/resource policy sandboxes are created with.
    fn capabilities(&self) -> &CapabilityPolicy;

    /// `true` when any violation must stop execution.
    fn blocks(&self, violations: &[SecurityViolation]) -> bool {
        violations.iter().any(|v| v.severity == Severity::High)
    }
}

/// One denylist entry.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub name: String,
    pub capability: String,
    pub severity: Severity,
    pattern: Regex,
}

impl PolicyRule {
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        capability: impl Into<String>,
        severity: Severity,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            capability: capability.into(),
            severity,
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

/// `(name, pattern, capability, severity)` for the standard denylist.
const STANDARD_RULES: &[(&str, &str, &str, Severity)] = &[
    ("eval", r"\beval\s*\(", "dynamic_eval", Severity::High),
    ("function_constructor", r"\bnew\s+Function\s*\(", "dynamic_function", Severity::High),
    ("process", r"\bprocess\s*\.", "process_control", Severity::High),
    ("child_process", r"\bchild_process\b", "process_spawn", Severity::High),
    ("require", r"\brequire\s*\(", "module_loading", Severity::Medium),
    ("dynamic_import", r"\bimport\s*\(", "module_loading", Severity::Medium),
    ("global", r"\bglobal(This)?\b", "host_globals", Severity::Medium),
    ("fs", r"\bfs\s*\.", "filesystem", Severity::Medium),
    ("host_path", r"\b__(dirname|filename)\b", "host_globals", Severity::Low),
];

/// Regex-table policy engine.
#[derive(Debug, Clone)]
pub struct PatternPolicy {
    rules: Vec<PolicyRule>,
    capabilities: CapabilityPolicy,
}

impl PatternPolicy {
    /// An empty rule table (nothing is ever flagged).
    pub fn empty(capabilities: CapabilityPolicy) -> Self {
        Self {
            rules: Vec::new(),
            capabilities,
        }
    }

    /// The standard denylist with the given capability policy.
    pub fn standard(capabilities: CapabilityPolicy) -> Self {
        let rules = STANDARD_RULES
            .iter()
            .filter_map(|(name, pattern, capability, severity)| {
                PolicyRule::new(*name, pattern, *capability, *severity).ok()
            })
            .collect();
        Self {
            rules,
            capabilities,
        }
    }

    /// Append a rule and return `self` (builder pattern).
    pub fn with_rule(mut self, rule: PolicyRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }
}

impl Default for PatternPolicy {
    fn default() -> Self {
        Self::standard(CapabilityPolicy::default())
    }
}

impl Policy for PatternPolicy {
    fn screen(&self, source: &str) -> Vec<SecurityViolation> {
        let mut violations = Vec::new();
        for rule in &self.rules {
            // Matched against the whole source so tokens split across lines
            // (`eval\n(`) are still caught; reported once per line.
            let mut last_line = 0;
            for m in rule.pattern.find_iter(source) {
                let line = source[..m.start()].matches('\n').count() + 1;
                if line == last_line {
                    continue;
                }
                last_line = line;
                violations.push(SecurityViolation {
                    pattern: rule.name.clone(),
                    capability: rule.capability.clone(),
                    severity: rule.severity,
                    line,
                });
            }
        }
        violations
    }

    fn capabilities(&self) -> &CapabilityPolicy {
        &self.capabilities
    }
}
