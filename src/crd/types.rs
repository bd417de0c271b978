//! Enum types for upgrade state and conditions.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Coarse state of an upgrade, mirroring its conditions.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum UpgradeState {
    Upgrading,
    Complete,
    Error,
}

impl UpgradeState {
    pub const ALL: [Self; 3] = [Self::Upgrading, Self::Complete, Self::Error];
}

impl std::fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upgrading => write!(f, "Upgrading"),
            Self::Complete => write!(f, "Complete"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Conditions gating each upgrade phase.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum ConditionType {
    ChartsRepoReady,
    ManagedAddonsReady,
    ManifestUpgradeComplete,
    NodesUpgraded,
    Completed,
}

impl ConditionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChartsRepoReady => "ChartsRepoReady",
            Self::ManagedAddonsReady => "ManagedAddonsReady",
            Self::ManifestUpgradeComplete => "ManifestUpgradeComplete",
            Self::NodesUpgraded => "NodesUpgraded",
            Self::Completed => "Completed",
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes-style tri-state condition status.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
