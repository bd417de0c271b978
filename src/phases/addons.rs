//! Managed add-on snapshot phase.
//!
//! Freezes the set of system add-ons the upgrade waits for. Completion of each
//! entry is reported later by the add-on watcher.

use kube::ResourceExt;
use tracing::info;

use crate::config::Config;
use crate::crd::{ConditionType, ManagedAddon, ManagedAddonUpgradeStatus, Upgrade, UpgradeStatus};
use crate::error::Result;
use crate::k8s::{Cluster, selector_for};
use crate::resources::common::{SYSTEM_ADDON_LABEL, TRUE};
use crate::status;

/// Status entry for an add-on. Disabled add-ons are skipped and count as complete.
pub fn snapshot(addon: &ManagedAddon) -> ManagedAddonUpgradeStatus {
    ManagedAddonUpgradeStatus {
        name: addon.name_any(),
        job_name: addon.job_name().to_string(),
        disabled: !addon.spec.enabled,
        complete: !addon.spec.enabled,
    }
}

/// Set `ManagedAddonsReady` from the snapshot: True once every entry is complete.
pub fn update_condition(new_status: &mut UpgradeStatus, version: &str) {
    if new_status.managed_addon_status.iter().all(|a| a.complete) {
        status::set_ready(
            new_status,
            ConditionType::ManagedAddonsReady,
            "All managed add-ons are ready",
        );
    } else {
        status::set_upgrading(
            new_status,
            ConditionType::ManagedAddonsReady,
            format!("Waiting for managed add-ons to be upgraded to {version}"),
        );
    }
}

/// Snapshot the system add-ons into the status.
pub async fn execute<C: Cluster + ?Sized>(
    cluster: &C,
    config: &Config,
    upgrade: &Upgrade,
    current_status: &UpgradeStatus,
) -> Result<UpgradeStatus> {
    let mut new_status = current_status.clone();

    let addons = cluster
        .list_managed_addons(
            &config.system_namespace,
            &selector_for(&[(SYSTEM_ADDON_LABEL, TRUE)]),
        )
        .await?;

    new_status.managed_addon_status = addons.iter().map(snapshot).collect();
    info!(
        upgrade = %upgrade.name_any(),
        count = new_status.managed_addon_status.len(),
        "Snapshotted managed add-ons"
    );

    update_condition(&mut new_status, &upgrade.spec.version);
    Ok(new_status)
}
