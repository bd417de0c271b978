//! `ManagedAddon` resource, reconciled by the platform's add-on controller.
//!
//! Read-only from the upgrade operator's perspective.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Readiness condition reported by the add-on controller.
pub const ADDON_READY_CONDITION: &str = "Ready";

/// An optional platform component installed from a chart.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[kube(
    group = "management.puo.io",
    version = "v1",
    kind = "ManagedAddon",
    namespaced,
    status = "ManagedAddonStatus",
    printcolumn = r#"{"name":"CHART","type":"string","jsonPath":".spec.chart"}"#,
    printcolumn = r#"{"name":"VERSION","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"ENABLED","type":"boolean","jsonPath":".spec.enabled"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedAddonSpec {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub chart: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_content: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedAddonStatus {
    #[serde(default)]
    pub conditions: Vec<AddonCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub succeeded: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonCondition {
    pub r#type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ManagedAddon {
    /// The add-on's install job has finished successfully and it reports Ready.
    pub fn is_ready(&self) -> bool {
        let Some(status) = &self.status else {
            return false;
        };
        let ready = status
            .conditions
            .iter()
            .any(|c| c.r#type == ADDON_READY_CONDITION && c.status == "True");
        ready && status.completion_time.is_some() && status.succeeded >= 1
    }

    pub fn job_name(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.job_name.as_deref())
            .unwrap_or_default()
    }
}
