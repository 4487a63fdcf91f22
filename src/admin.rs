//! Minimal plaintext admin surface.
//!
//! Status and reset talk to the vitals collector over its queue; the
//! stop endpoints trigger the shared cancellation token that every stage
//! watches. Everything returns plaintext, suitable for curl and load
//! balancer probes.

use anyhow::{Context, Result};
use axum::{Router, extract::State, http::StatusCode, routing::get};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::vitals::VitalsEvent;

#[derive(Clone)]
pub struct AdminState {
    pub vitals: mpsc::Sender<VitalsEvent>,
    pub cancel: CancellationToken,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/con/status", get(status_handler))
        .route("/con/stack", get(stack_handler))
        .route("/con/reset", get(reset_handler))
        .route("/_ah/start", get(ok_handler))
        .route("/_ah/health", get(ok_handler))
        .route("/_ah/stop", get(stop_handler))
        .route("/stop", get(stop_handler))
        .with_state(state)
}

/// Bind the admin port up front; failure to bind is a config error the
/// caller treats as fatal.
pub async fn bind(port: u16) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding admin port {port}"))?;
    info!("admin surface listening on :{port}");
    Ok(listener)
}

pub async fn serve(listener: tokio::net::TcpListener, state: AdminState) -> Result<()> {
    let cancel = state.cancel.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("serving admin surface")
}

async fn ok_handler() -> &'static str {
    "OK"
}

async fn status_handler(State(state): State<AdminState>) -> (StatusCode, String) {
    let (reply_tx, reply_rx) = oneshot::channel();
    if state
        .vitals
        .send(VitalsEvent::Summary { reply: reply_tx })
        .await
        .is_err()
    {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "vitals unavailable\n".to_string(),
        );
    }
    match reply_rx.await {
        Ok(dump) => (StatusCode::OK, format!("OK\n{dump}")),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "vitals unavailable\n".to_string(),
        ),
    }
}

async fn reset_handler(State(state): State<AdminState>) -> (StatusCode, String) {
    match state.vitals.send(VitalsEvent::Reset).await {
        Ok(()) => (StatusCode::OK, "OK\n".to_string()),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "vitals unavailable\n".to_string(),
        ),
    }
}

async fn stop_handler(State(state): State<AdminState>) -> &'static str {
    info!("stop requested via admin surface");
    state.cancel.cancel();
    "OK"
}

/// Samples the process briefly and renders the profiler's stack report.
async fn stack_handler() -> (StatusCode, String) {
    let guard = match pprof::ProfilerGuardBuilder::default()
        .frequency(99)
        .blocklist(&["libc", "libgcc", "pthread", "vdso"])
        .build()
    {
        Ok(guard) => guard,
        Err(e) => {
            warn!("stack sampler failed to start: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "profiler unavailable\n".to_string(),
            );
        }
    };

    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    match guard.report().build() {
        Ok(report) => (StatusCode::OK, format!("{report:?}\n")),
        Err(e) => {
            warn!("stack report failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "profiler report failed\n".to_string(),
            )
        }
    }
}
