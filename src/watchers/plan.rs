//! Rollout plan watcher.
//!
//! A plan reporting complete only counts once every node its selector matches
//! carries the plan's current hash. Converged plans are recorded in
//! `PlanStatus`; `NodesUpgraded` turns True once both the server and the agent
//! plan have converged.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::core::Selector;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{Controller, watcher};
use kube::{Api, ResourceExt};
use tracing::{debug, info};

use super::{finish, log_result, update_status};
use crate::controller::{Context, error_policy};
use crate::crd::{ConditionType, Plan, PlanRolloutStatus, UpgradeStatus};
use crate::error::{PuoError, Result};
use crate::k8s::Cluster;
use crate::resources::common::{MANAGED_NODE_LABEL, TRUE, UPGRADE_NAME_LABEL, plan_node_label};
use crate::resources::plan::{agent_plan_name, server_plan_name};
use crate::status;
use crate::telemetry::health::HealthState;

pub const CONTROLLER: &str = "plan";

/// Node label value excluding a node from a plan.
const DISABLED: &str = "disabled";

fn node_selector(plan: &Plan) -> Result<Selector> {
    match plan.spec.node_selector.clone() {
        Some(selector) => Selector::try_from(selector)
            .map_err(|e| PuoError::InvalidSelector(format!("plan {}: {e}", plan.name_any()))),
        None => Ok(Selector::default()),
    }
}

/// Names of selected nodes that have not run the plan generation `hash`.
pub async fn pending_nodes<C: Cluster + ?Sized>(
    cluster: &C,
    plan: &Plan,
    hash: &str,
) -> Result<Vec<String>> {
    let label = plan_node_label(&plan.name_any());
    let nodes = cluster.list_nodes(&node_selector(plan)?).await?;
    Ok(nodes
        .iter()
        .filter(|node| {
            node.labels()
                .get(&label)
                .is_none_or(|value| value != DISABLED && value != hash)
        })
        .map(ResourceExt::name_any)
        .collect())
}

/// Insert or refresh the entry for a converged plan. Returns whether anything changed.
fn record_converged(current: &mut UpgradeStatus, name: &str, hash: &str, version: &str) -> bool {
    let entry = PlanRolloutStatus {
        name: name.to_string(),
        latest_hash: hash.to_string(),
        latest_version: version.to_string(),
        complete: true,
        last_update_time: Some(Utc::now()),
    };

    match current.plan_status.iter_mut().find(|p| p.name == name) {
        Some(existing)
            if existing.complete
                && existing.latest_hash == entry.latest_hash
                && existing.latest_version == entry.latest_version =>
        {
            false
        }
        Some(existing) => {
            *existing = entry;
            true
        }
        None => {
            current.plan_status.push(entry);
            true
        }
    }
}

fn plan_converged(current: &UpgradeStatus, name: &str) -> bool {
    current.plan_status.iter().any(|p| p.name == name && p.complete)
}

pub async fn handle<C: Cluster>(ctx: &Context<C>, plan: &Plan) -> Result<()> {
    if !plan.is_complete() {
        return Ok(());
    }
    let Some(upgrade_name) = plan.labels().get(UPGRADE_NAME_LABEL).cloned() else {
        return Ok(());
    };
    let Some(plan_status) = plan.status.as_ref() else {
        return Ok(());
    };
    let Some(hash) = plan_status.latest_hash.as_deref().filter(|h| !h.is_empty()) else {
        return Ok(());
    };
    let version = plan_status
        .latest_version
        .clone()
        .or_else(|| plan.spec.version.clone())
        .unwrap_or_default();
    let plan_name = plan.name_any();

    let pending = pending_nodes(&ctx.cluster, plan, hash).await?;
    if !pending.is_empty() {
        debug!(
            plan = %plan_name,
            pending = pending.len(),
            "Plan complete but nodes have not converged"
        );
        return Ok(());
    }

    let server = server_plan_name(&upgrade_name);
    let agent = agent_plan_name(&upgrade_name);
    update_status(ctx, &upgrade_name, |_, current| {
        let mut changed = record_converged(current, &plan_name, hash, &version);
        if changed {
            info!(upgrade = %upgrade_name, plan = %plan_name, hash = %hash, "Plan converged");
        }

        if plan_converged(current, &server)
            && plan_converged(current, &agent)
            && !status::is_true(current, ConditionType::NodesUpgraded)
        {
            info!(upgrade = %upgrade_name, "All nodes upgraded");
            status::set_ready(
                current,
                ConditionType::NodesUpgraded,
                format!("All nodes upgraded to {version}"),
            );
            changed = true;
        }
        changed
    })
    .await
}

pub async fn reconcile(obj: Arc<Plan>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = handle(&ctx, &obj).await;
    finish(&ctx, CONTROLLER, started, result)
}

/// Run the plan watcher until shutdown.
///
/// Node changes re-trigger every known plan so convergence is re-evaluated
/// when the last node gets labelled.
pub async fn run(ctx: Arc<Context>, health: HealthState) {
    let client = ctx.cluster.client().clone();
    let plans: Api<Plan> = Api::namespaced(client.clone(), &ctx.config.upgrade_namespace);
    let nodes: Api<Node> = Api::all(client);

    let controller = Controller::new(plans, watcher::Config::default().labels(UPGRADE_NAME_LABEL));
    let store = controller.store();

    health.controller_started(CONTROLLER);
    controller
        .watches(
            nodes,
            watcher::Config::default().labels(&format!("{MANAGED_NODE_LABEL}={TRUE}")),
            move |_node| {
                store
                    .state()
                    .iter()
                    .map(|plan| ObjectRef::from_obj(plan.as_ref()))
                    .collect::<Vec<_>>()
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| log_result(CONTROLLER, res))
        .await;
}
