//! Custom error types for puo.

use thiserror::Error;

/// Errors that can occur while orchestrating a platform upgrade.
#[derive(Error, Debug)]
pub enum PuoError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<PuoError>>),

    #[error("Conflict updating {0}: object has been modified")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    #[error("Upgrade not possible: {0}")]
    UpgradeNotPossible(String),

    #[error("Invalid label selector: {0}")]
    InvalidSelector(String),

    #[error("Upgrade check request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upgrade check returned {0}")]
    UpgradeCheck(String),
}

pub type Result<T, E = PuoError> = std::result::Result<T, E>;

impl PuoError {
    /// Returns true if this error is transient and should be retried.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Kube(_) | Self::Conflict(_) | Self::NotFound(_) | Self::Http(_)
        )
    }

    /// Returns true if a write was rejected because the object changed since it was read.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Kube(kube::Error::Api(e)) => e.code == 409,
            _ => false,
        }
    }
}
