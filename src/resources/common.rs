//! Labels and naming shared by every generated object.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Toleration;
use kube::ResourceExt;

use crate::config::Config;
use crate::crd::Upgrade;

/// Name of the upgrade that owns an object.
pub const UPGRADE_NAME_LABEL: &str = "puo.io/upgrade-name";
/// Platform version an object was generated for.
pub const VERSION_LABEL: &str = "puo.io/version";
/// Role of a generated object within an upgrade.
pub const COMPONENT_LABEL: &str = "puo.io/upgrade-component";
/// Carried by exactly one upgrade, the one being processed.
pub const LATEST_UPGRADE_LABEL: &str = "puo.io/latest-upgrade";
/// Marks add-ons whose readiness gates the upgrade.
pub const SYSTEM_ADDON_LABEL: &str = "puo.io/system-addon";
/// Platform version an add-on was last reconciled for.
pub const SERVER_VERSION_LABEL: &str = "puo.io/server-version";
/// Marks nodes managed by the platform.
pub const MANAGED_NODE_LABEL: &str = "puo.io/managed";
/// Upgrade check endpoint a version record was fetched from.
pub const UPGRADE_CHECK_URL_LABEL: &str = "puo.io/upgrade-check-url";

/// Standard labels carried by the platform's own release workloads.
pub const APP_NAME_LABEL: &str = "app.kubernetes.io/name";
pub const APP_VERSION_LABEL: &str = "app.kubernetes.io/version";

pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";
pub const ARCH_LABEL: &str = "kubernetes.io/arch";
/// Set by the chart controller on install jobs.
pub const HELM_CHART_JOB_LABEL: &str = "helmcharts.helm.cattle.io/chart";
/// Prefix of the per-plan node label holding the last executed plan hash.
pub const PLAN_NODE_LABEL_PREFIX: &str = "plan.upgrade.cattle.io/";

pub const COMPONENT_SERVER: &str = "server";
pub const COMPONENT_AGENT: &str = "agent";

pub const TRUE: &str = "true";

/// Labels tying a generated object to an upgrade and its target version.
pub fn upgrade_labels(upgrade: &Upgrade) -> BTreeMap<String, String> {
    BTreeMap::from([
        (UPGRADE_NAME_LABEL.to_string(), upgrade.name_any()),
        (VERSION_LABEL.to_string(), upgrade.spec.version.clone()),
    ])
}

/// Registry for generated images: the upgrade's override, else the global setting.
pub fn registry<'a>(upgrade: &'a Upgrade, config: &'a Config) -> &'a str {
    upgrade
        .spec
        .registry
        .as_deref()
        .map(|r| r.trim_end_matches('/'))
        .filter(|r| !r.is_empty())
        .unwrap_or(&config.system_image_registry)
}

pub fn image(registry: &str, repository: &str, tag: &str) -> String {
    format!("{registry}/{repository}:{tag}")
}

/// Tolerations letting upgrade workloads run on tainted and cordoned nodes.
pub fn default_tolerations() -> Vec<Toleration> {
    let exists = |key: &str, effect: Option<&str>| Toleration {
        key: Some(key.to_string()),
        operator: Some("Exists".to_string()),
        effect: effect.map(ToString::to_string),
        ..Default::default()
    };
    let arch = |value: &str| Toleration {
        key: Some(ARCH_LABEL.to_string()),
        operator: Some("Equal".to_string()),
        value: Some(value.to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Default::default()
    };
    vec![
        exists("node.kubernetes.io/unschedulable", Some("NoSchedule")),
        exists(CONTROL_PLANE_LABEL, Some("NoExecute")),
        exists("node-role.kubernetes.io/etcd", Some("NoExecute")),
        exists("CriticalAddonsOnly", None),
        exists("node.kubernetes.io/unreachable", Some("NoExecute")),
        arch("amd64"),
        arch("arm64"),
        arch("arm"),
    ]
}

/// Node label recording which generation of `plan_name` a node last executed.
pub fn plan_node_label(plan_name: &str) -> String {
    format!("{PLAN_NODE_LABEL_PREFIX}{plan_name}")
}
