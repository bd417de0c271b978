//! [`Cluster`] implementation backed by a `kube::Client`.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Service};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::Selector;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use super::Cluster;
use crate::crd::{HelmChart, ManagedAddon, Plan, Upgrade, Version};
use crate::error::Result;

/// Field manager recorded on every write.
pub const FIELD_MANAGER: &str = "puo";

/// Live cluster access.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    pub const fn client(&self) -> &Client {
        &self.client
    }

    fn upgrades(&self) -> Api<Upgrade> {
        Api::all(self.client.clone())
    }

    fn versions(&self) -> Api<Version> {
        Api::all(self.client.clone())
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn list_params(selector: &Selector) -> ListParams {
    ListParams::default().labels_from(selector)
}

/// Treat a 404 on delete as success.
fn ignore_not_found<T>(result: kube::Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get_upgrade(&self, name: &str) -> Result<Option<Upgrade>> {
        Ok(self.upgrades().get_opt(name).await?)
    }

    async fn list_upgrades(&self, selector: &Selector) -> Result<Vec<Upgrade>> {
        Ok(self.upgrades().list(&list_params(selector)).await?.items)
    }

    async fn set_upgrade_label(
        &self,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<Upgrade> {
        debug!("Setting label {}={:?} on upgrade {}", key, value, name);
        let patch = json!({ "metadata": { "labels": { key: value } } });
        Ok(self
            .upgrades()
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?)
    }

    async fn update_upgrade_status(&self, upgrade: &Upgrade) -> Result<Upgrade> {
        let name = upgrade.name_any();
        debug!(
            "Updating status for {} at resourceVersion {:?}",
            name,
            upgrade.resource_version()
        );

        // The resourceVersion turns the merge patch into a conditional write.
        let patch = json!({
            "metadata": { "resourceVersion": upgrade.resource_version() },
            "status": upgrade.status,
        });
        Ok(self
            .upgrades()
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.namespaced::<Deployment>(namespace).get_opt(name).await?)
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<Deployment>> {
        Ok(self
            .namespaced::<Deployment>(namespace)
            .list(&list_params(selector))
            .await?
            .items)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let namespace = deployment.namespace().unwrap_or_default();
        Ok(self
            .namespaced::<Deployment>(&namespace)
            .create(&PostParams::default(), deployment)
            .await?)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let namespace = deployment.namespace().unwrap_or_default();
        Ok(self
            .namespaced::<Deployment>(&namespace)
            .replace(&deployment.name_any(), &PostParams::default(), deployment)
            .await?)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.namespaced::<Service>(namespace).get_opt(name).await?)
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        let namespace = service.namespace().unwrap_or_default();
        Ok(self
            .namespaced::<Service>(&namespace)
            .create(&PostParams::default(), service)
            .await?)
    }

    async fn get_helm_chart(&self, namespace: &str, name: &str) -> Result<Option<HelmChart>> {
        Ok(self.namespaced::<HelmChart>(namespace).get_opt(name).await?)
    }

    async fn update_helm_chart(&self, chart: &HelmChart) -> Result<HelmChart> {
        let namespace = chart.namespace().unwrap_or_default();
        let patch = json!({
            "metadata": { "labels": chart.labels() },
            "spec": {
                "repo": chart.spec.repo,
                "chart": chart.spec.chart,
                "version": chart.spec.version,
            },
        });
        Ok(self
            .namespaced::<HelmChart>(&namespace)
            .patch(
                &chart.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?)
    }

    async fn get_plan(&self, namespace: &str, name: &str) -> Result<Option<Plan>> {
        Ok(self.namespaced::<Plan>(namespace).get_opt(name).await?)
    }

    async fn list_plans(&self, namespace: &str, selector: &Selector) -> Result<Vec<Plan>> {
        Ok(self
            .namespaced::<Plan>(namespace)
            .list(&list_params(selector))
            .await?
            .items)
    }

    async fn create_plan(&self, plan: &Plan) -> Result<Plan> {
        let namespace = plan.namespace().unwrap_or_default();
        Ok(self
            .namespaced::<Plan>(&namespace)
            .create(&PostParams::default(), plan)
            .await?)
    }

    async fn update_plan(&self, plan: &Plan) -> Result<Plan> {
        let namespace = plan.namespace().unwrap_or_default();
        Ok(self
            .namespaced::<Plan>(&namespace)
            .replace(&plan.name_any(), &PostParams::default(), plan)
            .await?)
    }

    async fn delete_plan(&self, namespace: &str, name: &str) -> Result<()> {
        ignore_not_found(
            self.namespaced::<Plan>(namespace)
                .delete(name, &DeleteParams::default())
                .await,
        )
    }

    async fn list_managed_addons(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<ManagedAddon>> {
        Ok(self
            .namespaced::<ManagedAddon>(namespace)
            .list(&list_params(selector))
            .await?
            .items)
    }

    async fn list_nodes(&self, selector: &Selector) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&list_params(selector)).await?.items)
    }

    async fn get_namespace_uid(&self, name: &str) -> Result<Option<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.and_then(|ns| ns.metadata.uid))
    }

    async fn server_version(&self) -> Result<String> {
        Ok(self.client.apiserver_version().await?.git_version)
    }

    async fn list_versions(&self) -> Result<Vec<Version>> {
        Ok(self.versions().list(&ListParams::default()).await?.items)
    }

    async fn get_version(&self, name: &str) -> Result<Option<Version>> {
        Ok(self.versions().get_opt(name).await?)
    }

    async fn create_version(&self, version: &Version) -> Result<Version> {
        Ok(self
            .versions()
            .create(&PostParams::default(), version)
            .await?)
    }

    async fn update_version(&self, version: &Version) -> Result<Version> {
        Ok(self
            .versions()
            .replace(&version.name_any(), &PostParams::default(), version)
            .await?)
    }

    async fn delete_version(&self, name: &str) -> Result<()> {
        ignore_not_found(self.versions().delete(name, &DeleteParams::default()).await)
    }
}
