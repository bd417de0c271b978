//! Version sync against the upgrade check endpoint.
//!
//! Each sync reports the running version together with a summary of the
//! cluster, then reconciles the cluster's `Version` records against the
//! releases the endpoint returns. Syncs run on a fixed interval and
//! immediately whenever the server version changes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use kube::core::Selector;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Interval;
use tracing::{debug, info, warn};

use crate::compat;
use crate::controller::Context;
use crate::crd::{Version, VersionSpec};
use crate::error::{PuoError, Result};
use crate::k8s::Cluster;
use crate::resources::common::UPGRADE_CHECK_URL_LABEL;

const CLUSTER_UID: &str = "clusterUID";
const NODE_COUNT: &str = "nodeCount";
const CPU_COUNT: &str = "cpuCount";
const MEMORY_SIZE: &str = "memorySize";
const NVIDIA_GPU_COUNT: &str = "nvidiaGPUCount";

/// Extended resource advertised by the NVIDIA device plugin.
const NVIDIA_GPU: &str = "nvidia.com/gpu";

/// Retries after the first attempt of an upgrade check request.
const CHECK_RETRIES: u32 = 3;
const CHECK_BACKOFF: Duration = Duration::from_secs(1);
const CHECK_BACKOFF_MAX: Duration = Duration::from_secs(30);
const CHECK_TIMEOUT: Duration = Duration::from_secs(30);

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckRequest {
    app_version: String,
    extra_info: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    #[serde(default)]
    versions: Vec<Release>,
}

/// A release offered by the upgrade check endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub name: String,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub runtime_version: Option<String>,
    #[serde(default)]
    pub min_upgradable_version: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Release {
    fn to_version(&self, source: &str) -> Version {
        Version {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                labels: Some(BTreeMap::from([(
                    UPGRADE_CHECK_URL_LABEL.to_string(),
                    source.to_string(),
                )])),
                ..Default::default()
            },
            spec: VersionSpec {
                min_upgradable_version: self.min_upgradable_version.clone(),
                runtime_version: self.runtime_version.clone(),
                release_date: self.release_date.clone(),
                tags: self.tags.clone(),
            },
        }
    }
}

/// Label value identifying the endpoint: its host, or the raw string if it does not parse.
pub fn source_label(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(ToString::to_string))
        .unwrap_or_else(|| url.to_string())
}

/// Create or update every offered release that is a valid upgrade from
/// `current`, then delete records that are no longer reachable.
pub async fn sync_versions<C: Cluster + ?Sized>(
    cluster: &C,
    releases: &[Release],
    current: &str,
    url: &str,
) -> Result<()> {
    let current_version = compat::parse_version(current)?;
    let source = source_label(url);

    for release in releases {
        let desired = release.to_version(&source);
        match compat::can_upgrade(&current_version, &desired) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                debug!(version = %release.name, error = %e, "Skipping unparseable release");
                continue;
            }
        }

        match cluster.get_version(&release.name).await? {
            None => {
                info!(version = %release.name, "Adding upgradable version");
                cluster.create_version(&desired).await?;
            }
            Some(existing) if existing.spec != desired.spec => {
                info!(version = %release.name, "Updating upgradable version");
                let mut updated = existing;
                updated.spec = desired.spec;
                cluster.update_version(&updated).await?;
            }
            Some(_) => {}
        }
    }

    cleanup_versions(cluster, &current_version).await
}

async fn cleanup_versions<C: Cluster + ?Sized>(
    cluster: &C,
    current: &semver::Version,
) -> Result<()> {
    for version in cluster.list_versions().await? {
        let name = version.name_any();
        match compat::is_stale(current, &version) {
            Ok(true) => {
                info!(version = %name, "Removing old version");
                cluster.delete_version(&name).await?;
            }
            Ok(false) => {}
            Err(e) => warn!(version = %name, error = %e, "Skipping version record that does not parse"),
        }
    }
    Ok(())
}

/// Parse a resource quantity ("4", "3500m", "16Gi", "1.5") into base units.
///
/// Scientific notation is not supported.
fn parse_quantity(raw: &str) -> Option<f64> {
    const SUFFIXES: &[(&str, f64)] = &[
        ("n", 1e-9),
        ("u", 1e-6),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
        ("Ki", 1024.0),
        ("Mi", 1_048_576.0),
        ("Gi", GIB),
        ("Ti", GIB * 1024.0),
        ("Pi", GIB * 1_048_576.0),
        ("Ei", GIB * GIB),
    ];

    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let number: f64 = number.parse().ok()?;
    let factor = if suffix.is_empty() {
        1.0
    } else {
        SUFFIXES.iter().find(|(s, _)| *s == suffix)?.1
    };
    Some(number * factor)
}

/// Total CPU, memory (bytes) and NVIDIA GPUs across node capacities.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Capacity {
    cpu: f64,
    memory: f64,
    gpus: f64,
}

impl Capacity {
    fn of(nodes: &[Node]) -> Self {
        let mut total = Self::default();
        for node in nodes {
            let Some(capacity) = node.status.as_ref().and_then(|s| s.capacity.as_ref()) else {
                continue;
            };
            for (resource, slot) in [
                ("cpu", &mut total.cpu),
                ("memory", &mut total.memory),
                (NVIDIA_GPU, &mut total.gpus),
            ] {
                let Some(quantity) = capacity.get(resource) else {
                    continue;
                };
                match parse_quantity(&quantity.0) {
                    Some(value) => *slot += value,
                    None => debug!(
                        node = %node.name_any(),
                        resource,
                        quantity = %quantity.0,
                        "Skipping capacity that does not parse"
                    ),
                }
            }
        }
        total
    }

    /// Whole cores, or millicores when fractional.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn cpu_count(&self) -> String {
        let millis = (self.cpu * 1000.0).round() as u64;
        if millis % 1000 == 0 {
            (millis / 1000).to_string()
        } else {
            format!("{millis}m")
        }
    }

    /// Memory rounded up to whole Gi, or to whole Mi below 1Gi.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn memory_size(&self) -> String {
        let gib = self.memory / GIB;
        if gib < 1.0 {
            format!("{}Mi", (gib * 1024.0).ceil() as u64)
        } else {
            format!("{}Gi", gib.ceil() as u64)
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn gpu_count(&self) -> String {
        (self.gpus.round() as u64).to_string()
    }
}

/// Cluster summary sent with every upgrade check. The cluster is identified
/// by the UID of `namespace`.
pub async fn cluster_info<C: Cluster + ?Sized>(
    cluster: &C,
    namespace: &str,
) -> Result<BTreeMap<String, String>> {
    let nodes = cluster.list_nodes(&Selector::default()).await?;
    let uid = cluster
        .get_namespace_uid(namespace)
        .await?
        .ok_or_else(|| PuoError::NotFound(format!("Namespace {namespace}")))?;

    let capacity = Capacity::of(&nodes);
    let info = BTreeMap::from([
        (CLUSTER_UID.to_string(), uid),
        (NODE_COUNT.to_string(), nodes.len().to_string()),
        (CPU_COUNT.to_string(), capacity.cpu_count()),
        (MEMORY_SIZE.to_string(), capacity.memory_size()),
        (NVIDIA_GPU_COUNT.to_string(), capacity.gpu_count()),
    ]);
    debug!(?info, "Collected cluster info");
    Ok(info)
}

/// HTTP client for the upgrade check endpoint.
///
/// Transport failures, throttling and server errors are retried with
/// exponential backoff.
pub struct CheckClient {
    http: reqwest::Client,
    retries: u32,
    backoff: Duration,
}

impl CheckClient {
    pub fn new() -> Result<Self> {
        Self::with_backoff(CHECK_BACKOFF)
    }

    fn with_backoff(backoff: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(CHECK_TIMEOUT).build()?;
        Ok(Self {
            http,
            retries: CHECK_RETRIES,
            backoff,
        })
    }

    async fn send_with_retry(&self, url: &str, request: &CheckRequest) -> Result<CheckResponse> {
        let mut attempt = 0;
        loop {
            match self.send_once(url, request).await {
                Ok(response) => return Ok(response),
                Err((e, retryable)) if retryable && attempt < self.retries => {
                    let delay = self.backoff.saturating_mul(1 << attempt).min(CHECK_BACKOFF_MAX);
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.retries,
                        error = %e,
                        "Upgrade check failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err((e, _)) => return Err(e),
            }
        }
    }

    /// One request. Errors carry whether another attempt may succeed.
    async fn send_once(
        &self,
        url: &str,
        request: &CheckRequest,
    ) -> std::result::Result<CheckResponse, (PuoError, bool)> {
        let resp = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| (PuoError::from(e), true))?;

        let status = resp.status();
        if !status.is_success() {
            let retryable = status == StatusCode::TOO_MANY_REQUESTS
                || (status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED);
            return Err((PuoError::UpgradeCheck(status.to_string()), retryable));
        }
        resp.json().await.map_err(|e| (PuoError::from(e), false))
    }
}

/// One sync against `url`: report, fetch, then reconcile.
pub async fn check<C: Cluster>(
    ctx: &Context<C>,
    client: &CheckClient,
    server_version: &str,
    url: &str,
) -> Result<()> {
    let request = CheckRequest {
        app_version: server_version.to_string(),
        extra_info: cluster_info(&ctx.cluster, &ctx.config.system_namespace).await?,
    };

    let body = client.send_with_retry(url, &request).await?;
    debug!(count = body.versions.len(), "Upgrade check returned versions");

    sync_versions(&ctx.cluster, &body.versions, server_version, url).await
}

/// What woke the syncer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Interval,
    ServerVersion,
}

/// Wait for the next tick or server version change. `None` once the version
/// channel is closed.
async fn next_trigger(
    ticker: &mut Interval,
    server_version: &mut watch::Receiver<String>,
) -> Option<Trigger> {
    tokio::select! {
        _ = ticker.tick() => Some(Trigger::Interval),
        changed = server_version.changed() => changed.ok().map(|()| Trigger::ServerVersion),
    }
}

/// Run the version syncer until the process exits. Returns immediately when
/// the upgrade check is disabled.
pub async fn run(ctx: Arc<Context>) {
    let Some(url) = ctx.config.upgrade_check_endpoint().map(ToString::to_string) else {
        info!("Upgrade check disabled");
        return;
    };
    let client = match CheckClient::new() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Failed to build upgrade check client, version sync disabled");
            return;
        }
    };

    info!(
        url = %url,
        interval_secs = ctx.config.upgrade_check_interval.as_secs(),
        "Starting version syncer"
    );
    let mut server_version = ctx.watch_server_version();
    let mut ticker = tokio::time::interval(ctx.config.upgrade_check_interval);
    while let Some(trigger) = next_trigger(&mut ticker, &mut server_version).await {
        let current = server_version.borrow_and_update().clone();
        debug!(?trigger, server_version = %current, "Syncing upgrade versions");
        if let Err(e) = check(&*ctx, &client, &current, &url).await {
            warn!(error = %e, "Failed syncing upgrade versions");
        }
    }
}
