//! Node rollout phase.
//!
//! Creates the server and agent plans, or updates them in place when their
//! desired spec changed. The plan watcher reports convergence.

use kube::ResourceExt;
use tracing::info;

use crate::config::Config;
use crate::crd::{ConditionType, Plan, Upgrade, UpgradeStatus};
use crate::error::{PuoError, Result};
use crate::k8s::Cluster;
use crate::resources::plan::{generate_agent_plan, generate_server_plan};
use crate::status;

/// Create `desired` if absent, or replace the stored plan when spec or labels differ.
async fn ensure_plan<C: Cluster + ?Sized>(cluster: &C, mut desired: Plan) -> Result<()> {
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();

    match cluster.get_plan(&namespace, &name).await? {
        None => {
            info!(plan = %name, "Creating plan");
            cluster.create_plan(&desired).await?;
        }
        Some(existing) => {
            let labels_match = desired
                .labels()
                .iter()
                .all(|(k, v)| existing.labels().get(k) == Some(v));
            if existing.spec == desired.spec && labels_match {
                return Ok(());
            }
            info!(plan = %name, "Updating plan");
            let mut labels = existing.labels().clone();
            labels.extend(desired.labels().clone());
            desired.metadata.labels = Some(labels);
            desired.metadata.resource_version = existing.resource_version();
            cluster.update_plan(&desired).await?;
        }
    }
    Ok(())
}

/// Execute one step of the node rollout phase.
pub async fn execute<C: Cluster + ?Sized>(
    cluster: &C,
    config: &Config,
    upgrade: &Upgrade,
    current_status: &UpgradeStatus,
) -> Result<UpgradeStatus> {
    let mut new_status = current_status.clone();

    let runtime_version = current_status
        .applied_runtime_version
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            PuoError::UpgradeNotPossible(format!(
                "runtime version of {} has not been resolved",
                upgrade.name_any()
            ))
        })?;

    ensure_plan(cluster, generate_server_plan(upgrade, config, runtime_version)).await?;
    ensure_plan(cluster, generate_agent_plan(upgrade, config, runtime_version)).await?;

    status::set_upgrading(
        &mut new_status,
        ConditionType::NodesUpgraded,
        format!("Waiting for nodes to be upgraded to {runtime_version}"),
    );
    Ok(new_status)
}
