//! `Plan` resource of the external node upgrade controller (`upgrade.cattle.io/v1`).
//!
//! Only the fields this operator reads or writes are modelled; the schema is
//! owned by the node upgrade controller.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Toleration;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reported by the node upgrade controller once every selected
/// node has run the current plan generation.
pub const PLAN_COMPLETE_CONDITION: &str = "Complete";

/// Desired node rollout.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "upgrade.cattle.io",
    version = "v1",
    kind = "Plan",
    namespaced,
    status = "PlanStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PlanSpec {
    #[serde(default)]
    pub concurrency: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    #[serde(default)]
    pub cordon: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain: Option<DrainSpec>,

    /// Runs before `upgrade`; used to block on another plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare: Option<ContainerSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<ContainerSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_active_deadline_secs: Option<i64>,
}

/// Container step executed on each node.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Node drain options passed through from the `Upgrade` spec.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DrainSpec {
    /// Drain timeout in nanoseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,

    /// Pod termination grace period in seconds; negative uses the pod's own value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_emptydir_data: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_daemon_sets: Option<bool>,

    #[serde(default)]
    pub force: bool,

    #[serde(default)]
    pub disable_eviction: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_wait_for_delete_timeout: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatus {
    #[serde(default)]
    pub conditions: Vec<PlanCondition>,

    /// Version of the current plan generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,

    /// Content hash of the current plan generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_hash: Option<String>,

    /// Nodes currently executing the plan.
    #[serde(default)]
    pub applying: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanCondition {
    pub r#type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

impl Plan {
    /// Whether the node upgrade controller reports the current generation as complete.
    pub fn is_complete(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.conditions
                .iter()
                .any(|c| c.r#type == PLAN_COMPLETE_CONDITION && c.status == "True")
        })
    }
}
