//! `Version` resource: a published platform release that may be offered as an upgrade.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A platform release. The object name is the release's version string.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[kube(
    group = "management.puo.io",
    version = "v1",
    kind = "Version",
    printcolumn = r#"{"name":"MIN-UPGRADABLE","type":"string","jsonPath":".spec.minUpgradableVersion"}"#,
    printcolumn = r#"{"name":"RUNTIME","type":"string","jsonPath":".spec.runtimeVersion"}"#,
    printcolumn = r#"{"name":"RELEASED","type":"string","jsonPath":".spec.releaseDate"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VersionSpec {
    /// Oldest version that may upgrade directly to this one. Empty means no minimum.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_upgradable_version: Option<String>,

    /// Node runtime version shipped with this release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,
}
