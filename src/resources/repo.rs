//! Chart repository workload serving the target version's charts.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::common::{COMPONENT_LABEL, default_tolerations, image, registry, upgrade_labels};
use crate::config::Config;
use crate::crd::Upgrade;

/// Name of the repository deployment, its service and its component label.
pub const REPO_NAME: &str = "upgrade-repo";
/// Image bundling every chart of a platform release.
pub const SYSTEM_CHARTS_IMAGE: &str = "puo-io/system-charts-repo";

const HTTP_PORT: i32 = 80;
const HTTP_PORT_NAME: &str = "http";

/// In-cluster URL the manifest charts are installed from.
pub fn repo_url(config: &Config) -> String {
    format!("http://{REPO_NAME}.{}.svc", config.system_namespace)
}

fn selector_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(COMPONENT_LABEL.to_string(), REPO_NAME.to_string())])
}

fn labels(upgrade: &Upgrade) -> BTreeMap<String, String> {
    let mut labels = upgrade_labels(upgrade);
    labels.extend(selector_labels());
    labels
}

pub fn repo_image(upgrade: &Upgrade, config: &Config) -> String {
    image(
        registry(upgrade, config),
        SYSTEM_CHARTS_IMAGE,
        &upgrade.spec.version,
    )
}

pub fn generate_deployment(upgrade: &Upgrade, config: &Config) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(REPO_NAME.to_string()),
            namespace: Some(config.system_namespace.clone()),
            labels: Some(labels(upgrade)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector_labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(upgrade)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: REPO_NAME.to_string(),
                        image: Some(repo_image(upgrade, config)),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        ports: Some(vec![ContainerPort {
                            name: Some(HTTP_PORT_NAME.to_string()),
                            container_port: HTTP_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    tolerations: Some(default_tolerations()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn generate_service(upgrade: &Upgrade, config: &Config) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(REPO_NAME.to_string()),
            namespace: Some(config.system_namespace.clone()),
            labels: Some(labels(upgrade)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector_labels()),
            ports: Some(vec![ServicePort {
                name: Some(HTTP_PORT_NAME.to_string()),
                port: HTTP_PORT,
                target_port: Some(IntOrString::String(HTTP_PORT_NAME.to_string())),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Image of the repository container, if any.
pub fn current_image(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .as_deref()
}

/// Point an existing deployment at a new upgrade's image and labels.
pub fn retarget(deployment: &mut Deployment, upgrade: &Upgrade, config: &Config) {
    let image = repo_image(upgrade, config);
    deployment
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels(upgrade));

    if let Some(pod) = deployment.spec.as_mut().map(|s| &mut s.template) {
        pod.metadata
            .get_or_insert_with(ObjectMeta::default)
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels(upgrade));
        if let Some(container) = pod
            .spec
            .as_mut()
            .and_then(|s| s.containers.first_mut())
        {
            container.image = Some(image);
        }
    }
}

/// Ready once every desired replica is ready.
///
/// Zero desired replicas counts as ready.
pub fn is_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    ready == desired
}
