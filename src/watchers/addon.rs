//! Managed add-on watcher.
//!
//! Flips the snapshotted add-on entry complete once the add-on's own
//! controller reports it ready at the target version.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::{Controller, watcher};
use kube::{Api, ResourceExt};
use tracing::info;

use super::{finish, latest_upgrade, log_result, update_status};
use crate::controller::{Context, error_policy};
use crate::crd::{ConditionType, ManagedAddon};
use crate::error::Result;
use crate::k8s::Cluster;
use crate::phases::addons;
use crate::resources::common::{SERVER_VERSION_LABEL, SYSTEM_ADDON_LABEL, TRUE};
use crate::status;
use crate::telemetry::health::HealthState;

pub const CONTROLLER: &str = "addon";

pub async fn handle<C: Cluster>(ctx: &Context<C>, addon: &ManagedAddon) -> Result<()> {
    if addon.labels().get(SYSTEM_ADDON_LABEL).map(String::as_str) != Some(TRUE)
        || !addon.is_ready()
    {
        return Ok(());
    }
    let Some(upgrade) = latest_upgrade(&ctx.cluster).await? else {
        return Ok(());
    };
    let version = upgrade.spec.version.clone();
    if addon.labels().get(SERVER_VERSION_LABEL) != Some(&version) {
        return Ok(());
    }

    let name = upgrade.name_any();
    let addon_name = addon.name_any();
    update_status(ctx, &name, |_, current| {
        // Only entries from the snapshot are tracked.
        let Some(entry) = current
            .managed_addon_status
            .iter_mut()
            .find(|a| a.name == addon_name)
        else {
            return false;
        };
        if entry.complete {
            return false;
        }
        info!(upgrade = %name, addon = %addon_name, "Managed add-on upgraded");
        entry.complete = true;

        if current.managed_addon_status.iter().all(|a| a.complete)
            && !status::is_true(current, ConditionType::ManagedAddonsReady)
        {
            addons::update_condition(current, &version);
        }
        true
    })
    .await
}

pub async fn reconcile(obj: Arc<ManagedAddon>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = handle(&ctx, &obj).await;
    finish(&ctx, CONTROLLER, started, result)
}

/// Run the managed add-on watcher until shutdown.
pub async fn run(ctx: Arc<Context>, health: HealthState) {
    let api: Api<ManagedAddon> =
        Api::namespaced(ctx.cluster.client().clone(), &ctx.config.system_namespace);
    let config = watcher::Config::default().labels(&format!("{SYSTEM_ADDON_LABEL}={TRUE}"));

    health.controller_started(CONTROLLER);
    Controller::new(api, config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| log_result(CONTROLLER, res))
        .await;
}
