//! In-memory [`Cluster`] for unit tests.
//!
//! Objects carry a `resourceVersion` that is bumped on every write, and
//! conditional writes against a stale version fail with a conflict like the
//! API server would.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Service};
use kube::ResourceExt;
use kube::core::{Selector, SelectorExt};

use super::Cluster;
use crate::crd::{HelmChart, ManagedAddon, Plan, Upgrade, Version};
use crate::error::{PuoError, Result};

type Key = (String, String);

#[derive(Default)]
struct State {
    resource_version: u64,
    writes: usize,
    server_version: String,
    upgrades: BTreeMap<String, Upgrade>,
    versions: BTreeMap<String, Version>,
    nodes: BTreeMap<String, Node>,
    namespaces: BTreeMap<String, Namespace>,
    deployments: BTreeMap<Key, Deployment>,
    services: BTreeMap<Key, Service>,
    helm_charts: BTreeMap<Key, HelmChart>,
    plans: BTreeMap<Key, Plan>,
    addons: BTreeMap<Key, ManagedAddon>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    /// Stamp a fresh resourceVersion on `obj` and count the write.
    fn stamp<K: ResourceExt>(&mut self, obj: &mut K) {
        obj.meta_mut().resource_version = Some(self.next_version());
        self.writes += 1;
    }
}

fn key<K: ResourceExt>(obj: &K) -> Key {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn fenced<K: ResourceExt>(current: &K, incoming: &K) -> Result<()> {
    match incoming.resource_version() {
        Some(rv) if Some(&rv) != current.resource_version().as_ref() => {
            Err(PuoError::Conflict(incoming.name_any()))
        }
        _ => Ok(()),
    }
}

fn matching<K: ResourceExt + Clone>(
    objects: impl Iterator<Item = K>,
    selector: &Selector,
) -> Vec<K> {
    objects.filter(|o| selector.matches(o.labels())).collect()
}

pub struct FakeCluster {
    state: Mutex<State>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                server_version: "v1.30.4+k3s1".to_string(),
                ..State::default()
            }),
        }
    }

    /// Number of writes performed through the [`Cluster`] interface.
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    // Seeding helpers do not count as writes.

    pub fn seed_upgrade(&self, mut upgrade: Upgrade) -> Upgrade {
        let mut state = self.state.lock().unwrap();
        upgrade.metadata.resource_version = Some(state.next_version());
        state.upgrades.insert(upgrade.name_any(), upgrade.clone());
        upgrade
    }

    pub fn seed_node(&self, mut node: Node) {
        let mut state = self.state.lock().unwrap();
        node.metadata.resource_version = Some(state.next_version());
        state.nodes.insert(node.name_any(), node);
    }

    pub fn seed_namespace(&self, mut namespace: Namespace) {
        let mut state = self.state.lock().unwrap();
        namespace.metadata.resource_version = Some(state.next_version());
        state.namespaces.insert(namespace.name_any(), namespace);
    }

    pub fn seed_deployment(&self, mut deployment: Deployment) {
        let mut state = self.state.lock().unwrap();
        deployment.metadata.resource_version = Some(state.next_version());
        state.deployments.insert(key(&deployment), deployment);
    }

    pub fn seed_helm_chart(&self, mut chart: HelmChart) {
        let mut state = self.state.lock().unwrap();
        chart.metadata.resource_version = Some(state.next_version());
        state.helm_charts.insert(key(&chart), chart);
    }

    pub fn seed_plan(&self, mut plan: Plan) {
        let mut state = self.state.lock().unwrap();
        plan.metadata.resource_version = Some(state.next_version());
        state.plans.insert(key(&plan), plan);
    }

    pub fn seed_addon(&self, mut addon: ManagedAddon) {
        let mut state = self.state.lock().unwrap();
        addon.metadata.resource_version = Some(state.next_version());
        state.addons.insert(key(&addon), addon);
    }

    pub fn seed_version(&self, mut version: Version) {
        let mut state = self.state.lock().unwrap();
        version.metadata.resource_version = Some(state.next_version());
        state.versions.insert(version.name_any(), version);
    }

    pub fn upgrade(&self, name: &str) -> Option<Upgrade> {
        self.state.lock().unwrap().upgrades.get(name).cloned()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        let state = self.state.lock().unwrap();
        state
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        let state = self.state.lock().unwrap();
        state
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn helm_chart(&self, namespace: &str, name: &str) -> Option<HelmChart> {
        let state = self.state.lock().unwrap();
        state
            .helm_charts
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn plan(&self, namespace: &str, name: &str) -> Option<Plan> {
        let state = self.state.lock().unwrap();
        state
            .plans
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn plan_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.plans.keys().map(|(_, name)| name.clone()).collect()
    }

    pub fn version_names(&self) -> Vec<String> {
        self.state.lock().unwrap().versions.keys().cloned().collect()
    }

    pub fn version(&self, name: &str) -> Option<Version> {
        self.state.lock().unwrap().versions.get(name).cloned()
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn get_upgrade(&self, name: &str) -> Result<Option<Upgrade>> {
        Ok(self.upgrade(name))
    }

    async fn list_upgrades(&self, selector: &Selector) -> Result<Vec<Upgrade>> {
        let state = self.state.lock().unwrap();
        Ok(matching(state.upgrades.values().cloned(), selector))
    }

    async fn set_upgrade_label(
        &self,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<Upgrade> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let mut upgrade = state
            .upgrades
            .get(name)
            .cloned()
            .ok_or_else(|| PuoError::NotFound(format!("Upgrade {name}")))?;
        match value {
            Some(v) => {
                upgrade.labels_mut().insert(key.to_string(), v.to_string());
            }
            None => {
                upgrade.labels_mut().remove(key);
            }
        }
        state.stamp(&mut upgrade);
        state.upgrades.insert(name.to_string(), upgrade.clone());
        Ok(upgrade)
    }

    async fn update_upgrade_status(&self, upgrade: &Upgrade) -> Result<Upgrade> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let name = upgrade.name_any();
        let mut stored = state
            .upgrades
            .get(&name)
            .cloned()
            .ok_or_else(|| PuoError::NotFound(format!("Upgrade {name}")))?;
        fenced(&stored, upgrade)?;
        stored.status.clone_from(&upgrade.status);
        state.stamp(&mut stored);
        state.upgrades.insert(name, stored.clone());
        Ok(stored)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.deployment(namespace, name))
    }

    async fn list_deployments(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<Deployment>> {
        let state = self.state.lock().unwrap();
        let in_namespace = state
            .deployments
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, d)| d.clone());
        Ok(matching(in_namespace, selector))
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let mut state = self.state.lock().unwrap();
        let k = key(deployment);
        if state.deployments.contains_key(&k) {
            return Err(PuoError::Conflict(format!("Deployment {} already exists", k.1)));
        }
        let mut created = deployment.clone();
        state.stamp(&mut created);
        state.deployments.insert(k, created.clone());
        Ok(created)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment> {
        let mut state = self.state.lock().unwrap();
        let k = key(deployment);
        let current = state
            .deployments
            .get(&k)
            .ok_or_else(|| PuoError::NotFound(format!("Deployment {}", k.1)))?;
        fenced(current, deployment)?;
        let mut updated = deployment.clone();
        state.stamp(&mut updated);
        state.deployments.insert(k, updated.clone());
        Ok(updated)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.service(namespace, name))
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        let mut state = self.state.lock().unwrap();
        let k = key(service);
        if state.services.contains_key(&k) {
            return Err(PuoError::Conflict(format!("Service {} already exists", k.1)));
        }
        let mut created = service.clone();
        state.stamp(&mut created);
        state.services.insert(k, created.clone());
        Ok(created)
    }

    async fn get_helm_chart(&self, namespace: &str, name: &str) -> Result<Option<HelmChart>> {
        Ok(self.helm_chart(namespace, name))
    }

    async fn update_helm_chart(&self, chart: &HelmChart) -> Result<HelmChart> {
        let mut state = self.state.lock().unwrap();
        let k = key(chart);
        let mut stored = state
            .helm_charts
            .get(&k)
            .cloned()
            .ok_or_else(|| PuoError::NotFound(format!("HelmChart {}", k.1)))?;
        stored
            .labels_mut()
            .extend(chart.labels().iter().map(|(k, v)| (k.clone(), v.clone())));
        stored.spec.repo.clone_from(&chart.spec.repo);
        stored.spec.chart.clone_from(&chart.spec.chart);
        stored.spec.version.clone_from(&chart.spec.version);
        state.stamp(&mut stored);
        state.helm_charts.insert(k, stored.clone());
        Ok(stored)
    }

    async fn get_plan(&self, namespace: &str, name: &str) -> Result<Option<Plan>> {
        Ok(self.plan(namespace, name))
    }

    async fn list_plans(&self, namespace: &str, selector: &Selector) -> Result<Vec<Plan>> {
        let state = self.state.lock().unwrap();
        let in_namespace = state
            .plans
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, p)| p.clone());
        Ok(matching(in_namespace, selector))
    }

    async fn create_plan(&self, plan: &Plan) -> Result<Plan> {
        let mut state = self.state.lock().unwrap();
        let k = key(plan);
        if state.plans.contains_key(&k) {
            return Err(PuoError::Conflict(format!("Plan {} already exists", k.1)));
        }
        let mut created = plan.clone();
        state.stamp(&mut created);
        state.plans.insert(k, created.clone());
        Ok(created)
    }

    async fn update_plan(&self, plan: &Plan) -> Result<Plan> {
        let mut state = self.state.lock().unwrap();
        let k = key(plan);
        let current = state
            .plans
            .get(&k)
            .ok_or_else(|| PuoError::NotFound(format!("Plan {}", k.1)))?;
        fenced(current, plan)?;
        let mut updated = plan.clone();
        updated.status.clone_from(&current.status);
        state.stamp(&mut updated);
        state.plans.insert(k, updated.clone());
        Ok(updated)
    }

    async fn delete_plan(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state
            .plans
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some()
        {
            state.writes += 1;
        }
        Ok(())
    }

    async fn list_managed_addons(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<ManagedAddon>> {
        let state = self.state.lock().unwrap();
        let in_namespace = state
            .addons
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, a)| a.clone());
        Ok(matching(in_namespace, selector))
    }

    async fn list_nodes(&self, selector: &Selector) -> Result<Vec<Node>> {
        let state = self.state.lock().unwrap();
        Ok(matching(state.nodes.values().cloned(), selector))
    }

    async fn get_namespace_uid(&self, name: &str) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .namespaces
            .get(name)
            .and_then(|ns| ns.metadata.uid.clone()))
    }

    async fn server_version(&self) -> Result<String> {
        Ok(self.state.lock().unwrap().server_version.clone())
    }

    async fn list_versions(&self) -> Result<Vec<Version>> {
        Ok(self.state.lock().unwrap().versions.values().cloned().collect())
    }

    async fn get_version(&self, name: &str) -> Result<Option<Version>> {
        Ok(self.version(name))
    }

    async fn create_version(&self, version: &Version) -> Result<Version> {
        let mut state = self.state.lock().unwrap();
        let name = version.name_any();
        if state.versions.contains_key(&name) {
            return Err(PuoError::Conflict(format!("Version {name} already exists")));
        }
        let mut created = version.clone();
        state.stamp(&mut created);
        state.versions.insert(name, created.clone());
        Ok(created)
    }

    async fn update_version(&self, version: &Version) -> Result<Version> {
        let mut state = self.state.lock().unwrap();
        let name = version.name_any();
        let current = state
            .versions
            .get(&name)
            .ok_or_else(|| PuoError::NotFound(format!("Version {name}")))?;
        fenced(current, version)?;
        let mut updated = version.clone();
        state.stamp(&mut updated);
        state.versions.insert(name, updated.clone());
        Ok(updated)
    }

    async fn delete_version(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.versions.remove(name).is_some() {
            state.writes += 1;
        }
        Ok(())
    }
}
