//! System deployment watcher.
//!
//! Sets `ChartsRepoReady` once the repository deployment serving the latest
//! upgrade's version has rolled out, and `ManifestUpgradeComplete` once every
//! deployment of the platform release carries the target version and has
//! rolled out. The second path completes the manifest phase even when the
//! install job records are lost.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::controller::Action;
use kube::runtime::{Controller, watcher};
use kube::{Api, ResourceExt};
use tracing::{debug, info};

use super::{finish, latest_upgrade, log_result, update_status};
use crate::controller::{Context, error_policy};
use crate::crd::{ConditionType, Upgrade};
use crate::error::Result;
use crate::k8s::{Cluster, selector_for};
use crate::resources::common::{APP_NAME_LABEL, APP_VERSION_LABEL, VERSION_LABEL};
use crate::resources::repo::{self, REPO_NAME};
use crate::status;
use crate::telemetry::health::HealthState;

pub const CONTROLLER: &str = "deployment";

/// The deployment controller has observed the latest spec and every replica is ready.
fn rolled_out(deployment: &Deployment) -> bool {
    let generation = deployment.metadata.generation.unwrap_or(0);
    let observed = deployment
        .status
        .as_ref()
        .and_then(|s| s.observed_generation)
        .unwrap_or(0);
    observed >= generation && repo::is_ready(deployment)
}

async fn sync_repo<C: Cluster>(ctx: &Context<C>, deployment: &Deployment, upgrade: &Upgrade) -> Result<()> {
    let version = &upgrade.spec.version;
    if deployment.labels().get(VERSION_LABEL) != Some(version) {
        debug!(upgrade = %upgrade.name_any(), "Repo deployment not yet at the target version");
        return Ok(());
    }

    let name = upgrade.name_any();
    update_status(ctx, &name, |_, current| {
        if status::is_true(current, ConditionType::ChartsRepoReady) {
            return false;
        }
        info!(upgrade = %name, version = %version, "Upgrade repo is ready");
        status::set_ready(
            current,
            ConditionType::ChartsRepoReady,
            format!("Upgrade repo {version} is ready"),
        );
        true
    })
    .await
}

async fn sync_manifest<C: Cluster>(
    ctx: &Context<C>,
    deployment: &Deployment,
    upgrade: &Upgrade,
) -> Result<()> {
    let version = &upgrade.spec.version;
    let current = upgrade.status.clone().unwrap_or_default();
    // Unset until the driver starts the manifest phase.
    if status::is_unset(&current, ConditionType::ManifestUpgradeComplete)
        || status::is_true(&current, ConditionType::ManifestUpgradeComplete)
        || deployment.labels().get(APP_VERSION_LABEL) != Some(version)
    {
        return Ok(());
    }

    let release = &ctx.config.core_chart_name;
    let deployments = ctx
        .cluster
        .list_deployments(
            &ctx.config.system_namespace,
            &selector_for(&[(APP_NAME_LABEL, release), (APP_VERSION_LABEL, version)]),
        )
        .await?;
    if let Some(pending) = deployments.iter().find(|d| !rolled_out(d)) {
        debug!(
            upgrade = %upgrade.name_any(),
            deployment = %pending.name_any(),
            "Release deployment still rolling out"
        );
        return Ok(());
    }

    let name = upgrade.name_any();
    update_status(ctx, &name, |_, current| {
        if status::is_unset(current, ConditionType::ManifestUpgradeComplete)
            || status::is_true(current, ConditionType::ManifestUpgradeComplete)
        {
            return false;
        }
        info!(upgrade = %name, release = %release, version = %version, "Release deployments rolled out");
        status::set_ready(
            current,
            ConditionType::ManifestUpgradeComplete,
            "Manifest upgrade is ready",
        );
        true
    })
    .await
}

pub async fn handle<C: Cluster>(ctx: &Context<C>, deployment: &Deployment) -> Result<()> {
    let is_repo = deployment.name_any() == REPO_NAME;
    let is_release =
        deployment.labels().get(APP_NAME_LABEL) == Some(&ctx.config.core_chart_name);
    if !(is_repo || is_release) || !rolled_out(deployment) {
        return Ok(());
    }

    let Some(upgrade) = latest_upgrade(&ctx.cluster).await? else {
        return Ok(());
    };
    if is_repo {
        sync_repo(ctx, deployment, &upgrade).await?;
    }
    if is_release {
        sync_manifest(ctx, deployment, &upgrade).await?;
    }
    Ok(())
}

pub async fn reconcile(obj: Arc<Deployment>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = handle(&ctx, &obj).await;
    finish(&ctx, CONTROLLER, started, result)
}

/// Run the system deployment watcher until shutdown. Both the repository and
/// the release deployments live in the system namespace.
pub async fn run(ctx: Arc<Context>, health: HealthState) {
    let api: Api<Deployment> =
        Api::namespaced(ctx.cluster.client().clone(), &ctx.config.system_namespace);

    health.controller_started(CONTROLLER);
    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| log_result(CONTROLLER, res))
        .await;
}
