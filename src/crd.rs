//! Custom resource definitions owned or consumed by the operator.

pub mod addon;
pub mod helm;
pub mod plan;
pub mod spec;
pub mod status;
pub mod types;
pub mod version;

pub use addon::ManagedAddon;
#[cfg(test)]
pub use addon::{AddonCondition, ManagedAddonSpec, ManagedAddonStatus};
pub use helm::HelmChart;
#[cfg(test)]
pub use helm::{HelmChartSpec, HelmChartStatus};
pub use plan::{ContainerSpec, Plan, PlanSpec};
#[cfg(test)]
pub use plan::{DrainSpec, PlanCondition, PlanStatus};
pub use spec::{Upgrade, UpgradeSpec};
pub use status::{
    ManagedAddonUpgradeStatus, PlanRolloutStatus, UpgradeCondition, UpgradeJobStatus,
    UpgradeStatus,
};
pub use types::{ConditionStatus, ConditionType, UpgradeState};
pub use version::{Version, VersionSpec};
