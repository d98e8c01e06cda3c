//! Metrics and health endpoints.
//!
//! - `/metrics`: Prometheus text exposition of the controller registry
//! - `/healthz`: always 200 while the process serves requests
//! - `/readyz`: 200 once the master caches have synced, 503 before and
//!   during shutdown

use crate::error::ControllerError;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Clone)]
struct ProbeState {
    registry: Registry,
    ready: Arc<AtomicBool>,
}

/// Routes of the probes server.
pub fn router(registry: Registry, ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(ProbeState { registry, ready })
        .layer(TraceLayer::new_for_http())
}

/// Serves `app` on `addr` until `shutdown` turns true.
pub async fn serve(
    addr: SocketAddr,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ControllerError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Probes listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // A dropped sender means the process is going away as well
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;
    Ok(())
}

async fn metrics(State(state): State<ProbeState>) -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ProbeState>) -> (StatusCode, &'static str) {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use control_loop::ControllerMetrics;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn get_path(app: Router, path: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_readiness_follows_flag() {
        let ready = Arc::new(AtomicBool::new(false));
        let app = router(Registry::new(), Arc::clone(&ready));

        let (status, _) = get_path(app.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        ready.store(true, Ordering::SeqCst);
        let (status, body) = get_path(app, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ready");
    }

    #[tokio::test]
    async fn test_liveness_is_independent_of_readiness() {
        let app = router(Registry::new(), Arc::new(AtomicBool::new(false)));

        let (status, body) = get_path(app, "/healthz").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_metrics_expose_controller_registry() {
        let registry = Registry::new();
        let metrics = ControllerMetrics::new(&registry, "seed-proxy-controller").unwrap();
        metrics.observe_reconcile(true, Duration::from_millis(20));
        let app = router(registry, Arc::new(AtomicBool::new(true)));

        let (status, body) = get_path(app, "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("controller_reconciliations_total"));
        assert!(body.contains(r#"controller="seed-proxy-controller""#));
    }
}
