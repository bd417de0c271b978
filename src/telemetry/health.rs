//! Health check endpoints (/healthz, /readyz).

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;
use tracing::info;

/// Shared readiness state: ready once every registered controller has started.
#[derive(Clone)]
pub struct HealthState {
    expected: usize,
    started: Arc<AtomicUsize>,
}

impl HealthState {
    pub fn new(expected_controllers: usize) -> Self {
        Self {
            expected: expected_controllers,
            started: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Record that one controller is running.
    pub fn controller_started(&self, name: &str) {
        let started = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "Controller {} started ({}/{})",
            name, started, self.expected
        );
    }

    pub fn is_ready(&self) -> bool {
        self.started.load(Ordering::SeqCst) >= self.expected
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(state: axum::extract::State<HealthState>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Start the health server on the given port.
pub async fn serve(port: u16, state: HealthState) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Health server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_after_all_controllers_start() {
        let state = HealthState::new(2);
        assert!(!state.is_ready());

        state.controller_started("upgrade");
        assert!(!state.is_ready());

        state.clone().controller_started("plan");
        assert!(state.is_ready());
    }

    #[tokio::test]
    async fn test_readyz_status_codes() {
        let state = HealthState::new(1);
        assert_eq!(
            readyz(axum::extract::State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        state.controller_started("upgrade");
        assert_eq!(readyz(axum::extract::State(state)).await, StatusCode::OK);
        assert_eq!(healthz().await, StatusCode::OK);
    }
}
