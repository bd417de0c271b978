//! Upgrade controller - phase dispatch, deletion cleanup and error policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event as FinalizerEvent, finalizer};
use kube::runtime::{Controller, watcher};
use kube::{Api, ResourceExt};
use tokio::sync::{OwnedMutexGuard, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::crd::{ConditionType, Upgrade, UpgradeState, UpgradeStatus};
use crate::error::{PuoError, Result};
use crate::k8s::{Cluster, KubeCluster, selector_for};
use crate::phases;
use crate::resources::common::UPGRADE_NAME_LABEL;
use crate::status;
use crate::telemetry::health::HealthState;
use crate::telemetry::metrics::Metrics;

pub const CONTROLLER: &str = "upgrade";
/// Finalizer guarding plan cleanup on deletion.
pub const FINALIZER: &str = "puo.io/upgrade-cleanup";
/// Delay before retrying a reconcile that returned an error.
pub const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Shared context for every controller.
pub struct Context<C = KubeCluster> {
    pub cluster: C,
    pub config: Config,
    pub metrics: Arc<Metrics>,
    locks: UpgradeLocks,
    /// Platform version the cluster currently runs. Starts at the configured
    /// server version and moves when an upgrade completes.
    server_version: watch::Sender<String>,
}

impl<C> Context<C> {
    pub fn new(cluster: C, config: Config, metrics: Arc<Metrics>) -> Self {
        let (server_version, _) = watch::channel(config.server_version.clone());
        Self {
            cluster,
            config,
            metrics,
            locks: UpgradeLocks::default(),
            server_version,
        }
    }

    pub fn server_version(&self) -> String {
        self.server_version.borrow().clone()
    }

    /// Receiver notified whenever the server version changes.
    pub fn watch_server_version(&self) -> watch::Receiver<String> {
        self.server_version.subscribe()
    }

    fn set_server_version(&self, version: &str) {
        self.server_version.send_if_modified(|current| {
            if current == version {
                return false;
            }
            info!(from = %current, to = %version, "Server version changed");
            *current = version.to_string();
            true
        });
    }
}

/// One async mutex per upgrade name, serializing driver steps of the same upgrade.
#[derive(Default)]
pub struct UpgradeLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UpgradeLocks {
    pub async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    pub fn forget(&self, name: &str) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}

/// The single forward step a driver invocation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Initialize,
    Repository,
    Addons,
    Manifest,
    Nodes,
    Complete,
    /// Waiting on a watcher; nothing to do.
    Wait,
}

/// Decide the next step from the current conditions.
pub fn next_step(current: &UpgradeStatus) -> Step {
    use ConditionType::{
        ChartsRepoReady, Completed, ManagedAddonsReady, ManifestUpgradeComplete, NodesUpgraded,
    };

    if status::is_unset(current, Completed) {
        return Step::Initialize;
    }
    if status::is_unset(current, ChartsRepoReady) || status::is_error(current, ChartsRepoReady) {
        return Step::Repository;
    }

    let repo_ready = status::is_true(current, ChartsRepoReady);
    let addons_ready = status::is_true(current, ManagedAddonsReady);
    let manifest_ready = status::is_true(current, ManifestUpgradeComplete);
    let nodes_ready = status::is_true(current, NodesUpgraded);

    if repo_ready
        && (status::is_unset(current, ManagedAddonsReady)
            || (current.managed_addon_status.is_empty() && !addons_ready))
    {
        return Step::Addons;
    }
    if repo_ready && !manifest_ready {
        return Step::Manifest;
    }
    if addons_ready
        && manifest_ready
        && (status::is_unset(current, NodesUpgraded) || status::is_error(current, NodesUpgraded))
    {
        return Step::Nodes;
    }
    if addons_ready && manifest_ready && nodes_ready {
        return Step::Complete;
    }
    Step::Wait
}

/// Write `after` if it differs from `before`.
///
/// `upgrade` carries the resourceVersion the write is conditioned on. A
/// conflict means another writer got there first; the resulting watch event
/// re-runs the step, so it is not an error.
async fn persist<C: Cluster>(
    ctx: &Context<C>,
    upgrade: &Upgrade,
    before: &UpgradeStatus,
    after: UpgradeStatus,
) -> Result<()> {
    if after == *before {
        return Ok(());
    }

    let name = upgrade.name_any();
    let mut desired = upgrade.clone();
    desired.status = Some(after);

    match ctx.cluster.update_upgrade_status(&desired).await {
        Ok(updated) => {
            if let Some(after) = &updated.status {
                ctx.metrics.record_status_change(&name, before, after);
            }
            Ok(())
        }
        Err(e) if e.is_conflict() => {
            debug!(upgrade = %name, "Status changed concurrently, step will be retried");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Advance an upgrade by at most one step.
pub async fn reconcile_upgrade<C: Cluster>(ctx: &Context<C>, name: &str) -> Result<Action> {
    let _guard = ctx.locks.acquire(name).await;

    // The watch cache may lag behind our own writes; decide on a fresh read.
    let Some(upgrade) = ctx.cluster.get_upgrade(name).await? else {
        return Ok(Action::await_change());
    };
    if upgrade.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let current = upgrade.status.clone().unwrap_or_default();
    if status::is_inert(&current) {
        return Ok(Action::await_change());
    }

    let step = next_step(&current);
    debug!(upgrade = %name, ?step, "Reconciling upgrade");

    let config = &ctx.config;
    let cluster = &ctx.cluster;
    let (phase, result) = match step {
        Step::Initialize => {
            let previous = ctx.server_version();
            let (marked, initial) = phases::init::execute(cluster, &previous, &upgrade).await?;
            let inert = status::is_inert(&initial);
            persist(ctx, &marked, &current, initial).await?;
            return Ok(requeue_unless(inert, config));
        }
        Step::Complete => {
            let mut new_status = current.clone();
            status::set_ready(&mut new_status, ConditionType::Completed, "Upgrade completed");
            new_status.state = Some(UpgradeState::Complete);
            new_status.complete_time = Some(Utc::now());
            info!(upgrade = %name, version = %upgrade.spec.version, "Upgrade completed");
            persist(ctx, &upgrade, &current, new_status).await?;
            ctx.set_server_version(&upgrade.spec.version);
            return Ok(Action::await_change());
        }
        Step::Wait => return Ok(Action::requeue(config.resync_interval)),
        Step::Repository => (
            ConditionType::ChartsRepoReady,
            phases::repo::execute(cluster, config, &upgrade, &current).await,
        ),
        Step::Addons => (
            ConditionType::ManagedAddonsReady,
            phases::addons::execute(cluster, config, &upgrade, &current).await,
        ),
        Step::Manifest => (
            ConditionType::ManifestUpgradeComplete,
            phases::manifest::execute(cluster, config, &upgrade, &current).await,
        ),
        Step::Nodes => (
            ConditionType::NodesUpgraded,
            phases::nodes::execute(cluster, config, &upgrade, &current).await,
        ),
    };

    let new_status = result.unwrap_or_else(|e| {
        warn!(upgrade = %name, phase = %phase, "Phase failed: {}", e);
        let mut failed = current.clone();
        status::set_error(&mut failed, phase, e.to_string());
        failed
    });

    persist(ctx, &upgrade, &current, new_status).await?;
    Ok(Action::requeue(config.resync_interval))
}

fn requeue_unless(inert: bool, config: &Config) -> Action {
    if inert {
        Action::await_change()
    } else {
        Action::requeue(config.resync_interval)
    }
}

/// Delete the rollout plans owned by a deleted upgrade and drop its
/// per-upgrade state.
pub async fn cleanup_upgrade<C: Cluster>(ctx: &Context<C>, name: &str) -> Result<Action> {
    let namespace = &ctx.config.upgrade_namespace;
    let plans = ctx
        .cluster
        .list_plans(namespace, &selector_for(&[(UPGRADE_NAME_LABEL, name)]))
        .await?;

    for plan in &plans {
        info!(upgrade = %name, plan = %plan.name_any(), "Deleting plan of removed upgrade");
        ctx.cluster.delete_plan(namespace, &plan.name_any()).await?;
    }

    ctx.locks.forget(name);
    ctx.metrics.forget_upgrade(name);
    Ok(Action::await_change())
}

/// Reconcile an Upgrade resource.
pub async fn reconcile(obj: Arc<Upgrade>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let api: Api<Upgrade> = Api::all(ctx.cluster.client().clone());

    let driver: &Context = &ctx;

    let result = finalizer(&api, FINALIZER, obj, |event| async move {
        match event {
            FinalizerEvent::Apply(upgrade) => reconcile_upgrade(driver, &upgrade.name_any()).await,
            FinalizerEvent::Cleanup(upgrade) => cleanup_upgrade(driver, &upgrade.name_any()).await,
        }
    })
    .await
    .map_err(|e| PuoError::Finalizer(Box::new(e)));

    let outcome = if result.is_ok() { "success" } else { "error" };
    ctx.metrics.observe_reconcile(CONTROLLER, outcome, started);
    result
}

/// Error policy shared by every controller.
pub fn error_policy<K: ResourceExt>(obj: Arc<K>, err: &PuoError, _ctx: Arc<Context>) -> Action {
    if err.is_transient() {
        warn!("Reconcile of {} failed, will retry: {}", obj.name_any(), err);
    } else {
        error!("Controller error for {}: {}", obj.name_any(), err);
    }
    Action::requeue(ERROR_REQUEUE)
}

/// Run the Upgrade controller until shutdown.
pub async fn run(ctx: Arc<Context>, health: HealthState) {
    let api: Api<Upgrade> = Api::all(ctx.cluster.client().clone());

    info!("Starting Upgrade controller");
    health.controller_started(CONTROLLER);
    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled upgrade {}", obj.name),
                Err(e) => warn!("Upgrade reconcile failed: {}", e),
            }
        })
        .await;
}

#[cfg(test)]
pub mod test_support {
    use std::sync::Arc;

    use prometheus_client::registry::Registry;

    use super::Context;
    use crate::config::Config;
    use crate::k8s::fake::FakeCluster;
    use crate::telemetry::metrics::Metrics;

    pub fn context(cluster: FakeCluster) -> Context<FakeCluster> {
        let mut registry = Registry::default();
        Context::new(
            cluster,
            Config::new_for_test(),
            Arc::new(Metrics::new(&mut registry)),
        )
    }
}
