//! Condition helpers and conflict-retrying status updates.

use chrono::Utc;
use kube::ResourceExt;
use tracing::debug;

use crate::crd::{
    ConditionStatus, ConditionType, Upgrade, UpgradeCondition, UpgradeState, UpgradeStatus,
};
use crate::error::Result;
use crate::k8s::Cluster;

/// Attempts made by [`update_with_retry`] before a conflict is returned.
pub const CONFLICT_RETRIES: usize = 5;

pub const REASON_INITIALIZING: &str = "Initializing";
pub const REASON_UPGRADING: &str = "Upgrading";
pub const REASON_ERROR: &str = "Error";
pub const REASON_READY: &str = "Ready";

pub fn condition(status: &UpgradeStatus, ty: ConditionType) -> Option<&UpgradeCondition> {
    status.conditions.iter().find(|c| c.r#type == ty)
}

pub fn condition_status(status: &UpgradeStatus, ty: ConditionType) -> Option<ConditionStatus> {
    condition(status, ty).map(|c| c.status)
}

pub fn is_true(status: &UpgradeStatus, ty: ConditionType) -> bool {
    condition_status(status, ty) == Some(ConditionStatus::True)
}

/// A condition is in error when it is explicitly False.
pub fn is_error(status: &UpgradeStatus, ty: ConditionType) -> bool {
    condition_status(status, ty) == Some(ConditionStatus::False)
}

pub fn is_unset(status: &UpgradeStatus, ty: ConditionType) -> bool {
    condition(status, ty).is_none()
}

/// Completed upgrades and upgrades rejected at init are never touched again.
pub fn is_inert(status: &UpgradeStatus) -> bool {
    matches!(
        condition_status(status, ConditionType::Completed),
        Some(ConditionStatus::True | ConditionStatus::False)
    )
}

/// Set a condition, preserving other types.
///
/// Setting an identical condition is a no-op, and the transition time only
/// moves when the status value changes.
pub fn set_condition(
    status: &mut UpgradeStatus,
    ty: ConditionType,
    condition_status: ConditionStatus,
    reason: &str,
    message: Option<String>,
) {
    let now = Utc::now();

    if let Some(existing) = status.conditions.iter_mut().find(|c| c.r#type == ty) {
        if existing.status == condition_status
            && existing.reason == reason
            && existing.message == message
        {
            return;
        }
        if existing.status != condition_status {
            existing.last_transition_time = now;
        }
        existing.status = condition_status;
        existing.reason = reason.to_string();
        existing.message = message;
        return;
    }

    status.conditions.push(UpgradeCondition {
        r#type: ty,
        status: condition_status,
        reason: reason.to_string(),
        message,
        last_transition_time: now,
    });
}

/// Mark a phase as in progress.
pub fn set_upgrading(status: &mut UpgradeStatus, ty: ConditionType, message: impl Into<String>) {
    set_condition(
        status,
        ty,
        ConditionStatus::Unknown,
        REASON_UPGRADING,
        Some(message.into()),
    );
    status.state = Some(UpgradeState::Upgrading);
}

/// Mark a phase as failed and the whole upgrade as in error.
pub fn set_error(status: &mut UpgradeStatus, ty: ConditionType, message: impl Into<String>) {
    set_condition(
        status,
        ty,
        ConditionStatus::False,
        REASON_ERROR,
        Some(message.into()),
    );
    status.state = Some(UpgradeState::Error);
}

/// Mark a phase as done. An upgrade in error goes back to upgrading once no
/// condition is failed any more.
pub fn set_ready(status: &mut UpgradeStatus, ty: ConditionType, message: impl Into<String>) {
    set_condition(
        status,
        ty,
        ConditionStatus::True,
        REASON_READY,
        Some(message.into()),
    );
    if status.state == Some(UpgradeState::Error)
        && !status
            .conditions
            .iter()
            .any(|c| c.status == ConditionStatus::False)
    {
        status.state = Some(UpgradeState::Upgrading);
    }
}

/// Re-read an upgrade, apply `mutate` to a copy of its status and write it
/// back conditionally, retrying on conflicts.
///
/// `mutate` returns whether it changed anything; nothing is written otherwise.
/// Returns the status before and the object after a successful write, or
/// `None` when the upgrade is gone or no write was needed.
pub async fn update_with_retry<C, F>(
    cluster: &C,
    name: &str,
    mut mutate: F,
) -> Result<Option<(UpgradeStatus, Upgrade)>>
where
    C: Cluster + ?Sized,
    F: FnMut(&Upgrade, &mut UpgradeStatus) -> bool + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;

        let Some(current) = cluster.get_upgrade(name).await? else {
            debug!("Upgrade {} no longer exists, skipping status update", name);
            return Ok(None);
        };

        let before = current.status.clone().unwrap_or_default();
        let mut after = before.clone();
        if !mutate(&current, &mut after) || after == before {
            return Ok(None);
        }

        let mut desired = current.clone();
        desired.status = Some(after);
        match cluster.update_upgrade_status(&desired).await {
            Ok(updated) => return Ok(Some((before, updated))),
            Err(e) if e.is_conflict() && attempt < CONFLICT_RETRIES => {
                debug!(
                    "Conflict updating {} (attempt {}/{}), retrying",
                    current.name_any(),
                    attempt,
                    CONFLICT_RETRIES
                );
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::UpgradeSpec;
    use crate::k8s::fake::FakeCluster;

    #[test]
    fn test_set_condition_adds_new() {
        let mut status = UpgradeStatus::default();
        set_condition(
            &mut status,
            ConditionType::Completed,
            ConditionStatus::Unknown,
            REASON_INITIALIZING,
            None,
        );
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].r#type, ConditionType::Completed);
        assert!(!is_inert(&status));
    }

    #[test]
    fn test_set_condition_replaces_existing() {
        let mut status = UpgradeStatus::default();
        set_upgrading(&mut status, ConditionType::ChartsRepoReady, "waiting");
        set_ready(&mut status, ConditionType::ChartsRepoReady, "ready");
        assert_eq!(status.conditions.len(), 1);
        assert!(is_true(&status, ConditionType::ChartsRepoReady));
        assert_eq!(status.conditions[0].reason, REASON_READY);
    }

    #[test]
    fn test_set_condition_identical_is_noop() {
        let mut status = UpgradeStatus::default();
        set_upgrading(&mut status, ConditionType::NodesUpgraded, "waiting");
        let before = status.clone();
        set_upgrading(&mut status, ConditionType::NodesUpgraded, "waiting");
        assert_eq!(status, before);
    }

    #[test]
    fn test_transition_time_kept_when_status_unchanged() {
        let mut status = UpgradeStatus::default();
        set_upgrading(&mut status, ConditionType::ManagedAddonsReady, "first");
        let first = status.conditions[0].last_transition_time;
        set_upgrading(&mut status, ConditionType::ManagedAddonsReady, "second");
        assert_eq!(status.conditions[0].last_transition_time, first);
        assert_eq!(status.conditions[0].message.as_deref(), Some("second"));
    }

    #[test]
    fn test_set_condition_preserves_other_types() {
        let mut status = UpgradeStatus::default();
        set_ready(&mut status, ConditionType::ChartsRepoReady, "ok");
        set_upgrading(&mut status, ConditionType::ManifestUpgradeComplete, "waiting");
        assert_eq!(status.conditions.len(), 2);
        assert!(is_true(&status, ConditionType::ChartsRepoReady));
        assert!(is_unset(&status, ConditionType::NodesUpgraded));
    }

    #[test]
    fn test_set_error_marks_state() {
        let mut status = UpgradeStatus::default();
        set_error(&mut status, ConditionType::ManifestUpgradeComplete, "chart missing");
        assert!(is_error(&status, ConditionType::ManifestUpgradeComplete));
        assert_eq!(status.state, Some(UpgradeState::Error));

        set_upgrading(&mut status, ConditionType::ManifestUpgradeComplete, "retrying");
        assert_eq!(status.state, Some(UpgradeState::Upgrading));
    }

    #[test]
    fn test_set_ready_clears_error_state_once_nothing_fails() {
        let mut status = UpgradeStatus::default();
        set_error(&mut status, ConditionType::ChartsRepoReady, "image pull failed");
        set_error(&mut status, ConditionType::NodesUpgraded, "plan rejected");

        set_ready(&mut status, ConditionType::ChartsRepoReady, "ready");
        assert_eq!(status.state, Some(UpgradeState::Error));

        set_ready(&mut status, ConditionType::NodesUpgraded, "upgraded");
        assert_eq!(status.state, Some(UpgradeState::Upgrading));
    }

    #[test]
    fn test_is_inert() {
        let mut status = UpgradeStatus::default();
        set_error(&mut status, ConditionType::Completed, "downgrade");
        assert!(is_inert(&status));

        let mut status = UpgradeStatus::default();
        set_ready(&mut status, ConditionType::Completed, "done");
        assert!(is_inert(&status));
    }

    fn seeded() -> FakeCluster {
        let cluster = FakeCluster::new();
        cluster.seed_upgrade(Upgrade::new(
            "u1",
            UpgradeSpec {
                version: "v0.3.0".to_string(),
                runtime_version: None,
                registry: None,
                drain: None,
            },
        ));
        cluster
    }

    #[tokio::test]
    async fn test_update_with_retry_writes_change() {
        let cluster = seeded();
        let result = update_with_retry(&cluster, "u1", |_, status| {
            set_ready(status, ConditionType::ChartsRepoReady, "ready");
            true
        })
        .await
        .unwrap();

        let (before, after) = result.unwrap();
        assert!(before.conditions.is_empty());
        assert!(is_true(
            after.status.as_ref().unwrap(),
            ConditionType::ChartsRepoReady
        ));
        assert_eq!(cluster.writes(), 1);
    }

    #[tokio::test]
    async fn test_update_with_retry_skips_unchanged() {
        let cluster = seeded();
        let result = update_with_retry(&cluster, "u1", |_, _| true).await.unwrap();
        assert!(result.is_none());

        let result = update_with_retry(&cluster, "u1", |_, status| {
            set_ready(status, ConditionType::ChartsRepoReady, "ready");
            false
        })
        .await
        .unwrap();
        assert!(result.is_none());
        assert_eq!(cluster.writes(), 0);
    }

    #[tokio::test]
    async fn test_update_with_retry_missing_upgrade() {
        let cluster = FakeCluster::new();
        let result = update_with_retry(&cluster, "gone", |_, _| true).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_update_with_retry_sees_concurrent_writes() {
        let cluster = seeded();
        update_with_retry(&cluster, "u1", |_, status| {
            set_ready(status, ConditionType::ChartsRepoReady, "ready");
            true
        })
        .await
        .unwrap();

        // A second writer starts from the fresh object, not a stale copy.
        update_with_retry(&cluster, "u1", |_, status| {
            set_upgrading(status, ConditionType::ManagedAddonsReady, "waiting");
            true
        })
        .await
        .unwrap();

        let status = cluster.upgrade("u1").unwrap().status.unwrap();
        assert!(is_true(&status, ConditionType::ChartsRepoReady));
        assert!(!is_unset(&status, ConditionType::ManagedAddonsReady));
    }
}
