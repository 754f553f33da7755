use serde::{Deserialize, Serialize};

/// The seven workflow phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradePhase {
    Preparation,
    BackgroundLearning,
    SandboxTesting,
    Integration,
    Validation,
    Deployment,
    Cleanup,
}

impl UpgradePhase {
    pub const ALL: [UpgradePhase; 7] = [
        UpgradePhase::Preparation,
        UpgradePhase::BackgroundLearning,
        UpgradePhase::SandboxTesting,
        UpgradePhase::Integration,
        UpgradePhase::Validation,
        UpgradePhase::Deployment,
        UpgradePhase::Cleanup,
    ];

    /// Zero-based position in the workflow.
    pub fn index(self) -> usize {
        match self {
            UpgradePhase::Preparation => 0,
            UpgradePhase::BackgroundLearning => 1,
            UpgradePhase::SandboxTesting => 2,
            UpgradePhase::Integration => 3,
            UpgradePhase::Validation => 4,
            UpgradePhase::Deployment => 5,
            UpgradePhase::Cleanup => 6,
        }
    }

    /// Progress percentage reported while this phase runs.
    pub fn progress(self) -> u8 {
        (self.index() * 100 / Self::ALL.len()) as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UpgradePhase::Preparation => "preparation",
            UpgradePhase::BackgroundLearning => "background_learning",
            UpgradePhase::SandboxTesting => "sandbox_testing",
            UpgradePhase::Integration => "integration",
            UpgradePhase::Validation => "validation",
            UpgradePhase::Deployment => "deployment",
            UpgradePhase::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_are_ordered() {
        for (i, phase) in UpgradePhase::ALL.iter().enumerate() {
            assert_eq!(phase.index(), i);
        }
    }

    #[test]
    fn test_progress_values() {
        assert_eq!(UpgradePhase::Preparation.progress(), 0);
        assert_eq!(UpgradePhase::Validation.progress(), 57);
        assert_eq!(UpgradePhase::Cleanup.progress(), 85);
    }

    #[test]
    fn test_display_matches_serde() {
        let json = serde_json::to_string(&UpgradePhase::BackgroundLearning).unwrap();
        assert_eq!(json, "\"background_learning\"");
        assert_eq!(UpgradePhase::BackgroundLearning.to_string(), "background_learning");
    }
}
