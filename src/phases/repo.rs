//! Chart repository phase.
//!
//! Makes sure the repository deployment serving the target version's charts
//! exists, runs the right image and is ready.

use kube::ResourceExt;
use tracing::info;

use crate::config::Config;
use crate::crd::{ConditionType, Upgrade, UpgradeStatus};
use crate::error::Result;
use crate::k8s::Cluster;
use crate::resources::repo::{self, REPO_NAME};
use crate::status;

/// Execute one step of the repository phase.
pub async fn execute<C: Cluster + ?Sized>(
    cluster: &C,
    config: &Config,
    upgrade: &Upgrade,
    current_status: &UpgradeStatus,
) -> Result<UpgradeStatus> {
    let mut new_status = current_status.clone();
    let name = upgrade.name_any();
    let version = &upgrade.spec.version;
    let namespace = &config.system_namespace;

    let existing = cluster.get_deployment(namespace, REPO_NAME).await?;
    ensure_service(cluster, config, upgrade).await?;

    let Some(mut deployment) = existing else {
        info!(upgrade = %name, version = %version, "Creating upgrade repo");
        cluster
            .create_deployment(&repo::generate_deployment(upgrade, config))
            .await?;
        status::set_upgrading(
            &mut new_status,
            ConditionType::ChartsRepoReady,
            format!("Waiting for upgrade repo {version} to be ready"),
        );
        return Ok(new_status);
    };

    let desired_image = repo::repo_image(upgrade, config);
    if repo::current_image(&deployment) != Some(desired_image.as_str()) {
        info!(upgrade = %name, image = %desired_image, "Upgrading repo image");
        repo::retarget(&mut deployment, upgrade, config);
        cluster.update_deployment(&deployment).await?;
        status::set_upgrading(
            &mut new_status,
            ConditionType::ChartsRepoReady,
            format!("Upgrading repo version to {version}"),
        );
        return Ok(new_status);
    }

    if repo::is_ready(&deployment) {
        status::set_ready(
            &mut new_status,
            ConditionType::ChartsRepoReady,
            format!("Upgrade repo {version} is ready"),
        );
    } else {
        status::set_upgrading(
            &mut new_status,
            ConditionType::ChartsRepoReady,
            format!("Waiting for upgrade repo {version} to be ready"),
        );
    }
    Ok(new_status)
}

/// Create the repository service if absent. An existing service is left alone.
async fn ensure_service<C: Cluster + ?Sized>(
    cluster: &C,
    config: &Config,
    upgrade: &Upgrade,
) -> Result<()> {
    if cluster
        .get_service(&config.system_namespace, REPO_NAME)
        .await?
        .is_none()
    {
        cluster
            .create_service(&repo::generate_service(upgrade, config))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ConditionStatus, UpgradeState};
    use crate::k8s::fake::FakeCluster;
    use crate::resources::common::test_support::upgrade;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};

    fn ready(mut deployment: Deployment) -> Deployment {
        deployment.status = Some(DeploymentStatus {
            ready_replicas: Some(1),
            ..Default::default()
        });
        deployment
    }

    #[tokio::test]
    async fn test_creates_deployment_and_service() {
        let cluster = FakeCluster::new();
        let config = Config::new_for_test();
        let u = upgrade("u1", "v0.3.0");

        let s = execute(&cluster, &config, &u, &UpgradeStatus::default())
            .await
            .unwrap();

        assert_eq!(
            status::condition_status(&s, ConditionType::ChartsRepoReady),
            Some(ConditionStatus::Unknown)
        );
        assert_eq!(s.state, Some(UpgradeState::Upgrading));
        assert!(cluster.deployment("puo-system", REPO_NAME).is_some());
        assert!(cluster.service("puo-system", REPO_NAME).is_some());
    }

    #[tokio::test]
    async fn test_retargets_stale_image() {
        let cluster = FakeCluster::new();
        let config = Config::new_for_test();
        cluster.seed_deployment(ready(repo::generate_deployment(
            &upgrade("u0", "v0.2.0"),
            &config,
        )));

        let s = execute(&cluster, &config, &upgrade("u1", "v0.3.0"), &UpgradeStatus::default())
            .await
            .unwrap();

        let deployment = cluster.deployment("puo-system", REPO_NAME).unwrap();
        assert_eq!(
            repo::current_image(&deployment),
            Some("docker.io/puo-io/system-charts-repo:v0.3.0")
        );
        let condition = status::condition(&s, ConditionType::ChartsRepoReady).unwrap();
        assert_eq!(condition.status, ConditionStatus::Unknown);
        assert_eq!(
            condition.message.as_deref(),
            Some("Upgrading repo version to v0.3.0")
        );
    }

    #[tokio::test]
    async fn test_ready_deployment_sets_condition() {
        let cluster = FakeCluster::new();
        let config = Config::new_for_test();
        let u = upgrade("u1", "v0.3.0");
        cluster.seed_deployment(ready(repo::generate_deployment(&u, &config)));

        let s = execute(&cluster, &config, &u, &UpgradeStatus::default())
            .await
            .unwrap();
        assert!(status::is_true(&s, ConditionType::ChartsRepoReady));
    }

    #[tokio::test]
    async fn test_unready_deployment_keeps_waiting() {
        let cluster = FakeCluster::new();
        let config = Config::new_for_test();
        let u = upgrade("u1", "v0.3.0");
        cluster.seed_deployment(repo::generate_deployment(&u, &config));

        let s = execute(&cluster, &config, &u, &UpgradeStatus::default())
            .await
            .unwrap();
        assert_eq!(
            status::condition_status(&s, ConditionType::ChartsRepoReady),
            Some(ConditionStatus::Unknown)
        );
    }

    #[tokio::test]
    async fn test_existing_service_is_not_replaced() {
        let cluster = FakeCluster::new();
        let config = Config::new_for_test();
        let u = upgrade("u1", "v0.3.0");
        cluster.seed_deployment(ready(repo::generate_deployment(&u, &config)));
        cluster
            .create_service(&repo::generate_service(&upgrade("u0", "v0.2.0"), &config))
            .await
            .unwrap();
        let writes = cluster.writes();

        execute(&cluster, &config, &u, &UpgradeStatus::default())
            .await
            .unwrap();
        assert_eq!(cluster.writes(), writes);
    }
}
