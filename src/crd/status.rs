//! `Upgrade` status types.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ConditionStatus, ConditionType, UpgradeState};

/// Install job tracked for one manifest chart.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeJobStatus {
    /// Name of the chart being upgraded.
    pub chart_name: String,
    /// Name of the install job scheduled for the chart.
    pub name: String,
    #[serde(default)]
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

/// Convergence record for one rollout plan.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanRolloutStatus {
    pub name: String,
    #[serde(default)]
    pub latest_hash: String,
    #[serde(default)]
    pub latest_version: String,
    #[serde(default)]
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

/// Managed add-on snapshotted when the add-on phase starts.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedAddonUpgradeStatus {
    pub name: String,
    #[serde(default)]
    pub job_name: String,
    /// Disabled add-ons are skipped and count as complete.
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub complete: bool,
}

/// A condition on the `Upgrade` status.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeCondition {
    pub r#type: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

/// Status of an `Upgrade`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStatus {
    /// Phase gates, one entry per condition type.
    #[serde(default)]
    pub conditions: Vec<UpgradeCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<UpgradeState>,

    /// Platform version running when the upgrade started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<String>,

    /// Node runtime version running when the upgrade started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_runtime_version: Option<String>,

    /// Platform version this upgrade applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_version: Option<String>,

    /// Node runtime version the rollout plans target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_runtime_version: Option<String>,

    #[serde(default)]
    pub upgrade_jobs: Vec<UpgradeJobStatus>,

    #[serde(default)]
    pub plan_status: Vec<PlanRolloutStatus>,

    #[serde(default)]
    pub managed_addon_status: Vec<ManagedAddonUpgradeStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_time: Option<DateTime<Utc>>,
}
