//! Manifest chart phase.
//!
//! Points the platform's CRD and core charts at the target version, CRD chart
//! first. The job watcher marks each entry complete when its install job
//! finishes after the upgrade started.

use std::collections::BTreeMap;

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::config::Config;
use crate::crd::{ConditionType, HelmChart, Upgrade, UpgradeJobStatus, UpgradeStatus};
use crate::error::{PuoError, Result};
use crate::k8s::Cluster;
use crate::resources::common::upgrade_labels;
use crate::resources::repo::repo_url;
use crate::status;

/// Job name recorded before the chart controller reports one.
pub fn initial_job_name(chart: &str) -> String {
    format!("helm-install-{chart}")
}

fn initial_jobs(config: &Config) -> Vec<UpgradeJobStatus> {
    let now = Utc::now();
    config
        .manifest_charts()
        .iter()
        .map(|chart| UpgradeJobStatus {
            chart_name: (*chart).to_string(),
            name: initial_job_name(chart),
            complete: false,
            last_update_time: Some(now),
        })
        .collect()
}

fn job_complete(jobs: &[UpgradeJobStatus], chart: &str) -> bool {
    jobs.iter().any(|j| j.chart_name == chart && j.complete)
}

/// Apply the desired source and labels to `chart`. Returns whether anything changed.
fn apply_desired(chart: &mut HelmChart, repo: &str, version: &str, labels: &BTreeMap<String, String>) -> bool {
    let mut changed = false;

    if chart.spec.repo.as_deref() != Some(repo) {
        chart.spec.repo = Some(repo.to_string());
        changed = true;
    }
    let name = chart.name_any();
    if chart.spec.chart != name {
        chart.spec.chart = name;
        changed = true;
    }
    if chart.spec.version.as_deref() != Some(version) {
        chart.spec.version = Some(version.to_string());
        changed = true;
    }

    let current = chart.labels_mut();
    for (key, value) in labels {
        if current.get(key) != Some(value) {
            current.insert(key.clone(), value.clone());
            changed = true;
        }
    }

    changed
}

/// Execute one step of the manifest phase.
pub async fn execute<C: Cluster + ?Sized>(
    cluster: &C,
    config: &Config,
    upgrade: &Upgrade,
    current_status: &UpgradeStatus,
) -> Result<UpgradeStatus> {
    let mut new_status = current_status.clone();
    let name = upgrade.name_any();
    let version = &upgrade.spec.version;

    if status::is_unset(current_status, ConditionType::ManifestUpgradeComplete) {
        new_status.upgrade_jobs = initial_jobs(config);
        status::set_upgrading(
            &mut new_status,
            ConditionType::ManifestUpgradeComplete,
            format!("Upgrading manifest charts to {version}"),
        );
        return Ok(new_status);
    }

    if !new_status.upgrade_jobs.is_empty() && new_status.upgrade_jobs.iter().all(|j| j.complete) {
        info!(upgrade = %name, "Manifest charts upgraded");
        status::set_ready(
            &mut new_status,
            ConditionType::ManifestUpgradeComplete,
            format!("Manifest charts upgraded to {version}"),
        );
        return Ok(new_status);
    }

    let repo = repo_url(config);
    let labels = upgrade_labels(upgrade);
    let [crd_chart, core_chart] = config.manifest_charts();

    for chart_name in [crd_chart, core_chart] {
        if chart_name == core_chart && !job_complete(&new_status.upgrade_jobs, crd_chart) {
            debug!(upgrade = %name, chart = %chart_name, "Waiting for CRD chart before core chart");
            break;
        }

        let mut chart = cluster
            .get_helm_chart(&config.system_namespace, chart_name)
            .await?
            .ok_or_else(|| {
                PuoError::NotFound(format!("HelmChart {}/{chart_name}", config.system_namespace))
            })?;

        let Some(entry) = new_status
            .upgrade_jobs
            .iter_mut()
            .find(|j| j.chart_name == chart_name)
        else {
            continue;
        };

        if apply_desired(&mut chart, &repo, version, &labels) {
            info!(upgrade = %name, chart = %chart_name, version = %version, "Updating manifest chart");
            let updated = cluster.update_helm_chart(&chart).await?;
            entry.complete = false;
            entry.last_update_time = Some(Utc::now());
            if let Some(job) = updated.job_name() {
                entry.name = job.to_string();
            }
        } else if let Some(job) = chart.job_name()
            && !entry.complete
            && entry.name != job
        {
            entry.name = job.to_string();
            entry.last_update_time = Some(Utc::now());
        }
    }

    status::set_upgrading(
        &mut new_status,
        ConditionType::ManifestUpgradeComplete,
        format!("Upgrading manifest charts to {version}"),
    );
    Ok(new_status)
}
