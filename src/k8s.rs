//! Cluster access used by the reconcilers.
//!
//! Every read and write the upgrade phases perform goes through [`Cluster`], so
//! the phases can be exercised against an in-memory cluster in tests.

pub mod client;
#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::core::{Expression, Selector};

use crate::crd::{HelmChart, ManagedAddon, Plan, Upgrade, Version};
use crate::error::Result;

pub use client::KubeCluster;

#[async_trait]
pub trait Cluster: Send + Sync {
    // Upgrades (cluster-scoped)
    async fn get_upgrade(&self, name: &str) -> Result<Option<Upgrade>>;
    async fn list_upgrades(&self, selector: &Selector) -> Result<Vec<Upgrade>>;
    /// Set (`Some`) or remove (`None`) a label on an upgrade.
    async fn set_upgrade_label(&self, name: &str, key: &str, value: Option<&str>)
    -> Result<Upgrade>;
    /// Write the status of `upgrade`, failing with a conflict if its
    /// `resourceVersion` is no longer current.
    async fn update_upgrade_status(&self, upgrade: &Upgrade) -> Result<Upgrade>;

    // Repository workload
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;
    async fn list_deployments(&self, namespace: &str, selector: &Selector)
    -> Result<Vec<Deployment>>;
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment>;
    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment>;
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    async fn create_service(&self, service: &Service) -> Result<Service>;

    // Manifest charts
    async fn get_helm_chart(&self, namespace: &str, name: &str) -> Result<Option<HelmChart>>;
    /// Update labels and `repo`/`chart`/`version` of an existing chart.
    async fn update_helm_chart(&self, chart: &HelmChart) -> Result<HelmChart>;

    // Rollout plans
    async fn get_plan(&self, namespace: &str, name: &str) -> Result<Option<Plan>>;
    async fn list_plans(&self, namespace: &str, selector: &Selector) -> Result<Vec<Plan>>;
    async fn create_plan(&self, plan: &Plan) -> Result<Plan>;
    async fn update_plan(&self, plan: &Plan) -> Result<Plan>;
    async fn delete_plan(&self, namespace: &str, name: &str) -> Result<()>;

    // Read-only collaborators
    async fn list_managed_addons(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<ManagedAddon>>;
    async fn list_nodes(&self, selector: &Selector) -> Result<Vec<Node>>;
    /// UID of a namespace, `None` if it does not exist.
    async fn get_namespace_uid(&self, name: &str) -> Result<Option<String>>;
    /// Git version reported by the API server (e.g., "v1.31.0+k3s1").
    async fn server_version(&self) -> Result<String>;

    // Version records
    async fn list_versions(&self) -> Result<Vec<Version>>;
    async fn get_version(&self, name: &str) -> Result<Option<Version>>;
    async fn create_version(&self, version: &Version) -> Result<Version>;
    async fn update_version(&self, version: &Version) -> Result<Version>;
    async fn delete_version(&self, name: &str) -> Result<()>;
}

/// Build an equality selector from label pairs.
pub fn selector_for(labels: &[(&str, &str)]) -> Selector {
    labels
        .iter()
        .map(|(k, v)| Expression::Equal((*k).to_string(), (*v).to_string()))
        .collect()
}
