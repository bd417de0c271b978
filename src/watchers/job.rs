//! Chart install job watcher.
//!
//! Marks a manifest chart's job entry complete when an install job for that
//! chart succeeds after the upgrade started. Jobs that finished earlier belong
//! to a previous install and are ignored.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::controller::Action;
use kube::runtime::{Controller, watcher};
use kube::{Api, ResourceExt};
use tracing::info;

use super::{finish, latest_upgrade, log_result, update_status};
use crate::controller::{Context, error_policy};
use crate::error::Result;
use crate::k8s::Cluster;
use crate::resources::common::HELM_CHART_JOB_LABEL;
use crate::telemetry::health::HealthState;

pub const CONTROLLER: &str = "job";

/// Completion time of a job that has succeeded at least once.
pub fn succeeded_at(job: &Job) -> Option<DateTime<Utc>> {
    let job_status = job.status.as_ref()?;
    if job_status.succeeded.unwrap_or(0) < 1 {
        return None;
    }
    let completed = job_status.completion_time.as_ref()?.0;
    let nanos = u32::try_from(completed.subsec_nanosecond()).ok()?;
    DateTime::from_timestamp(completed.as_second(), nanos)
}

pub async fn handle<C: Cluster>(ctx: &Context<C>, job: &Job) -> Result<()> {
    let Some(chart) = job.labels().get(HELM_CHART_JOB_LABEL) else {
        return Ok(());
    };
    let [crd_chart, core_chart] = ctx.config.manifest_charts();
    if chart != crd_chart && chart != core_chart {
        return Ok(());
    }
    let Some(completed_at) = succeeded_at(job) else {
        return Ok(());
    };
    let Some(upgrade) = latest_upgrade(&ctx.cluster).await? else {
        return Ok(());
    };

    let name = upgrade.name_any();
    let job_name = job.name_any();
    update_status(ctx, &name, |_, current| {
        let Some(start) = current.start_time else {
            return false;
        };
        if completed_at <= start {
            return false;
        }
        // The core chart is only touched once the CRD chart is done.
        let crd_done = current
            .upgrade_jobs
            .iter()
            .any(|j| j.chart_name == crd_chart && j.complete);
        if chart == core_chart && !crd_done {
            return false;
        }

        let Some(entry) = current
            .upgrade_jobs
            .iter_mut()
            .find(|j| &j.chart_name == chart)
        else {
            return false;
        };
        if entry.complete {
            return false;
        }

        info!(upgrade = %name, chart = %chart, job = %job_name, "Manifest chart job completed");
        entry.complete = true;
        entry.name.clone_from(&job_name);
        entry.last_update_time = Some(Utc::now());
        true
    })
    .await
}

pub async fn reconcile(obj: Arc<Job>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let result = handle(&ctx, &obj).await;
    finish(&ctx, CONTROLLER, started, result)
}

/// Run the chart install job watcher until shutdown.
pub async fn run(ctx: Arc<Context>, health: HealthState) {
    let api: Api<Job> = Api::namespaced(ctx.cluster.client().clone(), &ctx.config.system_namespace);
    let config = watcher::Config::default().labels(HELM_CHART_JOB_LABEL);

    health.controller_started(CONTROLLER);
    Controller::new(api, config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| log_result(CONTROLLER, res))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_support::context;
    use crate::crd::{UpgradeJobStatus, UpgradeStatus};
    use crate::k8s::fake::FakeCluster;
    use crate::phases::manifest::initial_job_name;
    use crate::status::update_with_retry;
    use crate::watchers::test_support::tracked_upgrade;
    use chrono::Duration;
    use serde_json::json;

    fn job(name: &str, chart: &str, succeeded: i32, completed: Option<DateTime<Utc>>) -> Job {
        serde_json::from_value(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": name,
                "namespace": "puo-system",
                "labels": { HELM_CHART_JOB_LABEL: chart },
            },
            "status": {
                "succeeded": succeeded,
                "completionTime": completed.map(|t| t.to_rfc3339()),
            },
        }))
        .unwrap()
    }

    /// An upgrade that started an hour ago with both job entries pending.
    async fn setup() -> (Context<FakeCluster>, DateTime<Utc>) {
        let cluster = FakeCluster::new();
        tracked_upgrade(&cluster, "u1", "v0.3.0");
        let ctx = context(cluster);
        let start = Utc::now() - Duration::hours(1);
        let charts = ctx.config.manifest_charts().map(ToString::to_string);
        update_with_retry(&ctx.cluster, "u1", |_, s| {
            s.start_time = Some(start);
            s.upgrade_jobs = charts
                .iter()
                .map(|chart| UpgradeJobStatus {
                    chart_name: chart.clone(),
                    name: initial_job_name(chart),
                    complete: false,
                    last_update_time: None,
                })
                .collect();
            true
        })
        .await
        .unwrap();
        (ctx, start)
    }

    fn jobs(ctx: &Context<FakeCluster>) -> Vec<UpgradeJobStatus> {
        let s: UpgradeStatus = ctx.cluster.upgrade("u1").unwrap().status.unwrap();
        s.upgrade_jobs
    }

    #[test]
    fn test_succeeded_at() {
        let now = Utc::now();
        let done = job("j", "platform", 1, Some(now));
        assert_eq!(succeeded_at(&done), Some(now));
        assert!(succeeded_at(&job("j", "platform", 0, Some(now))).is_none());
        assert!(succeeded_at(&job("j", "platform", 1, None)).is_none());
    }

    #[tokio::test]
    async fn test_job_after_start_completes_entry() {
        let (ctx, start) = setup().await;
        let done = job("helm-install-platform-crd-x1", "platform-crd", 1, Some(start + Duration::minutes(5)));

        handle(&ctx, &done).await.unwrap();

        let jobs = jobs(&ctx);
        assert!(jobs[0].complete);
        assert_eq!(jobs[0].name, "helm-install-platform-crd-x1");
        assert!(!jobs[1].complete);
    }

    #[tokio::test]
    async fn test_job_before_start_is_ignored() {
        let (ctx, start) = setup().await;
        let old = job("helm-install-platform-crd", "platform-crd", 1, Some(start - Duration::minutes(5)));

        handle(&ctx, &old).await.unwrap();
        assert!(!jobs(&ctx)[0].complete);
    }

    #[tokio::test]
    async fn test_core_job_waits_for_crd_entry() {
        let (ctx, start) = setup().await;
        let after = Some(start + Duration::minutes(5));

        handle(&ctx, &job("core", "platform", 1, after)).await.unwrap();
        assert!(!jobs(&ctx)[1].complete);

        handle(&ctx, &job("crd", "platform-crd", 1, after)).await.unwrap();
        handle(&ctx, &job("core", "platform", 1, after)).await.unwrap();
        let jobs = jobs(&ctx);
        assert!(jobs[0].complete && jobs[1].complete);
    }

    #[tokio::test]
    async fn test_unrelated_chart_is_ignored() {
        let (ctx, start) = setup().await;
        let writes = ctx.cluster.writes();
        handle(&ctx, &job("other", "monitoring", 1, Some(start + Duration::minutes(5))))
            .await
            .unwrap();
        assert_eq!(ctx.cluster.writes(), writes);
    }
}
