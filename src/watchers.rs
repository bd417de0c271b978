//! Satellite controllers reporting external progress into the upgrade status.
//!
//! Each watcher reacts to one kind, resolves the upgrade it concerns and
//! applies a narrow, conflict-retrying status update. None of them takes the
//! driver's per-upgrade lock.

pub mod addon;
pub mod deployment;
pub mod job;
pub mod plan;

use std::fmt::Debug;
use std::time::Instant;

use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use tracing::{debug, warn};

use crate::controller::Context;
use crate::crd::{ConditionType, Upgrade, UpgradeStatus};
use crate::error::Result;
use crate::k8s::{Cluster, selector_for};
use crate::resources::common::{LATEST_UPGRADE_LABEL, TRUE};
use crate::status::{self, update_with_retry};

/// The upgrade carrying the latest marker, if it is still in progress.
pub async fn latest_upgrade<C: Cluster + ?Sized>(cluster: &C) -> Result<Option<Upgrade>> {
    let upgrades = cluster
        .list_upgrades(&selector_for(&[(LATEST_UPGRADE_LABEL, TRUE)]))
        .await?;
    Ok(upgrades
        .into_iter()
        .find(|u| u.status.as_ref().is_some_and(is_tracking)))
}

/// Initialized and not yet finished.
pub fn is_tracking(current: &UpgradeStatus) -> bool {
    !status::is_unset(current, ConditionType::Completed) && !status::is_inert(current)
}

/// Apply `mutate` to the status of `name`, skipping upgrades that are not in
/// progress, and record the resulting transitions.
pub async fn update_status<C, F>(ctx: &Context<C>, name: &str, mut mutate: F) -> Result<()>
where
    C: Cluster,
    F: FnMut(&Upgrade, &mut UpgradeStatus) -> bool + Send,
{
    let updated = update_with_retry(&ctx.cluster, name, |upgrade, current| {
        is_tracking(current) && mutate(upgrade, current)
    })
    .await?;

    if let Some((before, upgrade)) = updated
        && let Some(after) = &upgrade.status
    {
        ctx.metrics.record_status_change(name, &before, after);
    }
    Ok(())
}

/// Turn a handler result into the controller's action and count it.
pub fn finish<C>(
    ctx: &Context<C>,
    controller: &str,
    started: Instant,
    result: Result<()>,
) -> Result<Action> {
    let outcome = if result.is_ok() { "success" } else { "error" };
    ctx.metrics.observe_reconcile(controller, outcome, started);
    result.map(|()| Action::requeue(ctx.config.resync_interval))
}

/// Log the outcome of a watcher reconcile.
pub async fn log_result<K, E>(controller: &'static str, res: std::result::Result<(ObjectRef<K>, Action), E>)
where
    K: kube::Resource,
    E: Debug,
{
    match res {
        Ok((obj, _)) => debug!("{} watcher reconciled {}", controller, obj.name),
        Err(e) => warn!("{} watcher reconcile failed: {:?}", controller, e),
    }
}
