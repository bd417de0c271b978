//! Initialization phase.
//!
//! Claims the latest-upgrade marker and snapshots the versions the upgrade
//! starts from. Version errors found here are terminal for the upgrade.

use chrono::Utc;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::compat;
use crate::crd::{ConditionStatus, ConditionType, Upgrade, UpgradeSpec, UpgradeState, UpgradeStatus};
use crate::error::Result;
use crate::k8s::{Cluster, selector_for};
use crate::resources::common::{LATEST_UPGRADE_LABEL, TRUE};
use crate::status::{self, REASON_INITIALIZING};

/// Move the latest-upgrade marker to `upgrade`.
///
/// Returns the object as stored after relabeling.
pub async fn mark_latest<C: Cluster + ?Sized>(cluster: &C, upgrade: &Upgrade) -> Result<Upgrade> {
    let name = upgrade.name_any();

    for other in cluster
        .list_upgrades(&selector_for(&[(LATEST_UPGRADE_LABEL, TRUE)]))
        .await?
    {
        let other_name = other.name_any();
        if other_name != name {
            info!(upgrade = %name, previous = %other_name, "Removing latest marker from previous upgrade");
            cluster
                .set_upgrade_label(&other_name, LATEST_UPGRADE_LABEL, None)
                .await?;
        }
    }

    if upgrade.labels().get(LATEST_UPGRADE_LABEL).map(String::as_str) == Some(TRUE) {
        return Ok(upgrade.clone());
    }
    cluster
        .set_upgrade_label(&name, LATEST_UPGRADE_LABEL, Some(TRUE))
        .await
}

/// Build the initial status of an upgrade.
///
/// `previous` is the platform version being upgraded from and
/// `current_runtime` the version currently reported by the API server.
pub fn initial_status(previous: &str, spec: &UpgradeSpec, current_runtime: &str) -> UpgradeStatus {
    let mut new_status = UpgradeStatus {
        state: Some(UpgradeState::Upgrading),
        previous_version: Some(previous.to_string()),
        previous_runtime_version: Some(current_runtime.to_string()),
        applied_version: Some(spec.version.clone()),
        start_time: Some(Utc::now()),
        ..UpgradeStatus::default()
    };

    match compat::resolve_runtime_version(current_runtime, spec.runtime_version.as_deref()) {
        Ok(runtime) => {
            new_status.applied_runtime_version = Some(runtime);
            status::set_condition(
                &mut new_status,
                ConditionType::Completed,
                ConditionStatus::Unknown,
                REASON_INITIALIZING,
                None,
            );
        }
        Err(e) => {
            status::set_error(&mut new_status, ConditionType::Completed, e.to_string());
        }
    }

    new_status
}

/// Mark the upgrade as latest and compute its initial status.
///
/// Cluster failures are returned; version errors end up in the status.
pub async fn execute<C: Cluster + ?Sized>(
    cluster: &C,
    previous: &str,
    upgrade: &Upgrade,
) -> Result<(Upgrade, UpgradeStatus)> {
    let marked = mark_latest(cluster, upgrade).await?;
    let current_runtime = cluster.server_version().await?;
    let new_status = initial_status(previous, &marked.spec, &current_runtime);

    if status::is_error(&new_status, ConditionType::Completed) {
        warn!(
            upgrade = %marked.name_any(),
            runtime = %current_runtime,
            "Upgrade rejected at initialization"
        );
    } else {
        info!(
            upgrade = %marked.name_any(),
            from = %previous,
            to = %marked.spec.version,
            "Initialized upgrade"
        );
    }

    Ok((marked, new_status))
}
