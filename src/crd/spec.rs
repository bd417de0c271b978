//! `Upgrade` spec types.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::plan::DrainSpec;
use super::status::UpgradeStatus;

/// `Upgrade` requests that the platform be moved to a target version.
///
/// The spec is treated as immutable once the upgrade has been initialized.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "management.puo.io",
    version = "v1",
    kind = "Upgrade",
    status = "UpgradeStatus",
    printcolumn = r#"{"name":"VERSION","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"RUNTIME","type":"string","jsonPath":".status.appliedRuntimeVersion"}"#,
    printcolumn = r#"{"name":"STATE","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"COMPLETED","type":"string","jsonPath":".status.conditions[?(@.type==\"Completed\")].status"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeSpec {
    /// Target platform version (e.g., "v0.3.0").
    pub version: String,

    /// Target node runtime version. Empty keeps the current runtime version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,

    /// Image registry override for the repository and node upgrade images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,

    /// Drain policy applied to nodes while they are upgraded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain: Option<DrainSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn test_upgrade_is_cluster_scoped() {
        assert_eq!(Upgrade::group(&()), "management.puo.io");
        assert_eq!(Upgrade::kind(&()), "Upgrade");
        assert_eq!(Upgrade::plural(&()), "upgrades");
    }

    #[test]
    fn test_spec_serde_defaults() {
        let spec: UpgradeSpec = serde_json::from_str(r#"{"version":"v0.3.0"}"#).unwrap();
        assert_eq!(spec.version, "v0.3.0");
        assert!(spec.runtime_version.is_none());
        assert!(spec.registry.is_none());
        assert!(spec.drain.is_none());
    }

    #[test]
    fn test_spec_camel_case() {
        let spec: UpgradeSpec = serde_json::from_str(
            r#"{"version":"v0.3.0","runtimeVersion":"v1.31.0+k3s1","drain":{"force":true}}"#,
        )
        .unwrap();
        assert_eq!(spec.runtime_version.as_deref(), Some("v1.31.0+k3s1"));
        assert!(spec.drain.unwrap().force);
    }
}
