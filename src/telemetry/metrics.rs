//! Prometheus metrics for the puo operator.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::crd::{ConditionStatus, ConditionType, UpgradeState, UpgradeStatus};
use crate::status;

/// Labels for reconcile metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub controller: String,
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ControllerLabels {
    pub controller: String,
}

/// Labels for condition transition metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConditionLabels {
    pub condition: String,
    pub status: String,
}

/// Labels for the per-upgrade state gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabels {
    pub upgrade: String,
    pub state: String,
}

/// All Prometheus metrics for the operator.
pub struct Metrics {
    pub reconcile_total: Family<ReconcileLabels, Counter>,
    pub reconcile_duration_seconds: Family<ControllerLabels, Histogram>,
    pub condition_transition_total: Family<ConditionLabels, Counter>,
    pub upgrade_state_info: Family<StateLabels, Gauge>,
    pub upgrades_completed_total: Counter,
    pub upgrades_failed_total: Counter,
    pub upgrade_duration_seconds: Histogram,
}

const RECONCILE_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Whole upgrades take minutes to hours (node drains dominate).
const UPGRADE_DURATION_BUCKETS: &[f64] = &[
    60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0, 14400.0, 43200.0, 86400.0,
];

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let reconcile_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "puo_reconcile",
            "Total number of reconcile calls",
            reconcile_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ControllerLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(RECONCILE_BUCKETS.iter().copied())
            });
        registry.register(
            "puo_reconcile_duration_seconds",
            "Duration of reconcile calls in seconds",
            reconcile_duration_seconds.clone(),
        );

        let condition_transition_total = Family::<ConditionLabels, Counter>::default();
        registry.register(
            "puo_condition_transitions",
            "Total number of upgrade condition status changes",
            condition_transition_total.clone(),
        );

        let upgrade_state_info = Family::<StateLabels, Gauge>::default();
        registry.register(
            "puo_upgrade_state_info",
            "Current upgrade state (1=active, 0=inactive)",
            upgrade_state_info.clone(),
        );

        let upgrades_completed_total = Counter::default();
        registry.register(
            "puo_upgrades_completed",
            "Total number of upgrades that completed",
            upgrades_completed_total.clone(),
        );

        let upgrades_failed_total = Counter::default();
        registry.register(
            "puo_upgrades_failed",
            "Total number of upgrades rejected at initialization",
            upgrades_failed_total.clone(),
        );

        let upgrade_duration_seconds = Histogram::new(UPGRADE_DURATION_BUCKETS.iter().copied());
        registry.register(
            "puo_upgrade_duration_seconds",
            "Time from upgrade start to completion in seconds",
            upgrade_duration_seconds.clone(),
        );

        Self {
            reconcile_total,
            reconcile_duration_seconds,
            condition_transition_total,
            upgrade_state_info,
            upgrades_completed_total,
            upgrades_failed_total,
            upgrade_duration_seconds,
        }
    }

    /// Count a reconcile of `controller` and observe its duration.
    pub fn observe_reconcile(&self, controller: &str, result: &str, started: Instant) {
        self.reconcile_total
            .get_or_create(&ReconcileLabels {
                controller: controller.to_string(),
                result: result.to_string(),
            })
            .inc();
        self.reconcile_duration_seconds
            .get_or_create(&ControllerLabels {
                controller: controller.to_string(),
            })
            .observe(started.elapsed().as_secs_f64());
    }

    /// Record condition transitions and terminal outcomes between two persisted statuses.
    pub fn record_status_change(&self, upgrade: &str, before: &UpgradeStatus, after: &UpgradeStatus) {
        for condition in &after.conditions {
            if status::condition_status(before, condition.r#type) == Some(condition.status) {
                continue;
            }
            self.condition_transition_total
                .get_or_create(&ConditionLabels {
                    condition: condition.r#type.to_string(),
                    status: condition.status.to_string(),
                })
                .inc();

            if condition.r#type == ConditionType::Completed {
                match condition.status {
                    ConditionStatus::True => {
                        self.upgrades_completed_total.inc();
                        if let (Some(start), Some(end)) = (after.start_time, after.complete_time) {
                            let secs = (end - start).num_milliseconds().max(0) as f64 / 1000.0;
                            self.upgrade_duration_seconds.observe(secs);
                        }
                    }
                    ConditionStatus::False => {
                        self.upgrades_failed_total.inc();
                    }
                    ConditionStatus::Unknown => {}
                }
            }
        }

        if before.state != after.state {
            if let Some(old) = before.state {
                self.upgrade_state_info
                    .get_or_create(&StateLabels {
                        upgrade: upgrade.to_string(),
                        state: old.to_string(),
                    })
                    .set(0);
            }
            if let Some(new) = after.state {
                self.upgrade_state_info
                    .get_or_create(&StateLabels {
                        upgrade: upgrade.to_string(),
                        state: new.to_string(),
                    })
                    .set(1);
            }
        }
    }

    /// Drop the state series of a deleted upgrade.
    pub fn forget_upgrade(&self, upgrade: &str) {
        for state in UpgradeState::ALL {
            self.upgrade_state_info.remove(&StateLabels {
                upgrade: upgrade.to_string(),
                state: state.to_string(),
            });
        }
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}

/// Start the metrics server on the given port.
pub async fn serve(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    use axum::Router;
    use axum::routing::get;
    use tokio::net::TcpListener;
    use tracing::info;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Metrics server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
