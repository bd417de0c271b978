//! Node rollout plans.
//!
//! Two plans per upgrade: `server` for control-plane nodes and `agent` for the
//! remaining managed nodes. The agent plan's prepare step waits for the server
//! plan, so no worker starts before the control plane has converged.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use kube::ResourceExt;

use super::common::{
    COMPONENT_AGENT, COMPONENT_LABEL, COMPONENT_SERVER, CONTROL_PLANE_LABEL, MANAGED_NODE_LABEL,
    TRUE, default_tolerations, image, registry, upgrade_labels,
};
use crate::config::Config;
use crate::crd::{ContainerSpec, Plan, PlanSpec, Upgrade};

/// Image executing the node upgrade.
pub const NODE_UPGRADE_IMAGE: &str = "puo-io/node-upgrade";
/// Service account the node upgrade jobs run as.
pub const SERVICE_ACCOUNT: &str = "system-upgrade-controller";
/// Seven days.
pub const JOB_ACTIVE_DEADLINE_SECS: i64 = 604_800;

pub fn server_plan_name(upgrade_name: &str) -> String {
    format!("{upgrade_name}-{COMPONENT_SERVER}")
}

pub fn agent_plan_name(upgrade_name: &str) -> String {
    format!("{upgrade_name}-{COMPONENT_AGENT}")
}

fn control_plane_requirement(operator: &str, values: Option<Vec<String>>) -> LabelSelectorRequirement {
    LabelSelectorRequirement {
        key: CONTROL_PLANE_LABEL.to_string(),
        operator: operator.to_string(),
        values,
    }
}

fn base_plan(
    upgrade: &Upgrade,
    config: &Config,
    runtime_version: &str,
    component: &str,
    control_plane: LabelSelectorRequirement,
) -> Plan {
    let upgrade_name = upgrade.name_any();
    let mut labels = upgrade_labels(upgrade);
    labels.insert(COMPONENT_LABEL.to_string(), component.to_string());

    let node_image = image(
        registry(upgrade, config),
        NODE_UPGRADE_IMAGE,
        &upgrade.spec.version,
    );

    Plan {
        metadata: ObjectMeta {
            name: Some(format!("{upgrade_name}-{component}")),
            namespace: Some(config.upgrade_namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: PlanSpec {
            concurrency: 1,
            node_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    MANAGED_NODE_LABEL.to_string(),
                    TRUE.to_string(),
                )])),
                match_expressions: Some(vec![control_plane]),
            }),
            service_account_name: Some(SERVICE_ACCOUNT.to_string()),
            version: Some(runtime_version.to_string()),
            tolerations: default_tolerations(),
            cordon: true,
            drain: upgrade.spec.drain.clone(),
            prepare: None,
            upgrade: Some(ContainerSpec {
                image: node_image,
                command: Vec::new(),
                args: vec!["upgrade".to_string()],
            }),
            job_active_deadline_secs: Some(JOB_ACTIVE_DEADLINE_SECS),
        },
        status: None,
    }
}

/// Plan upgrading control-plane nodes.
pub fn generate_server_plan(upgrade: &Upgrade, config: &Config, runtime_version: &str) -> Plan {
    base_plan(
        upgrade,
        config,
        runtime_version,
        COMPONENT_SERVER,
        control_plane_requirement("In", Some(vec![TRUE.to_string()])),
    )
}

/// Plan upgrading every other managed node once the server plan has converged.
pub fn generate_agent_plan(upgrade: &Upgrade, config: &Config, runtime_version: &str) -> Plan {
    let mut plan = base_plan(
        upgrade,
        config,
        runtime_version,
        COMPONENT_AGENT,
        control_plane_requirement("DoesNotExist", None),
    );
    let prepare_image = plan
        .spec
        .upgrade
        .as_ref()
        .map(|u| u.image.clone())
        .unwrap_or_default();
    plan.spec.prepare = Some(ContainerSpec {
        image: prepare_image,
        command: Vec::new(),
        args: vec![
            "prepare".to_string(),
            server_plan_name(&upgrade.name_any()),
        ],
    });
    plan
}
