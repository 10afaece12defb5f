//! Read-only HTTP/WebSocket query API (§4.8): built on axum, serving
//! recent detections, rollup summaries, analytics, free-form search,
//! and a live event stream.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub use state::AppState;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CONCURRENT_REQUESTS: usize = 256;

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.config.allowed_origins);

    Router::new()
        .route("/health", get(routes::health))
        .route("/traffic/recent", get(routes::recent))
        .route("/traffic/summary", get(routes::summary))
        .route("/traffic/analytics", get(routes::analytics))
        .route("/traffic/search", get(routes::search))
        .route("/events/stream", get(ws::stream))
        .layer(axum::middleware::from_fn(middleware::request_id))
        .layer(TraceLayer::new_for_http())
        .layer(
            ServiceBuilder::new()
                .layer(axum::error_handling::HandleErrorLayer::new(|_: axum::BoxError| async {
                    axum::http::StatusCode::REQUEST_TIMEOUT
                }))
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(cors)
        .with_state(state)
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<_> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST, axum::http::Method::OPTIONS])
        .allow_origin(AllowOrigin::list(origins))
}

/// Binds and serves the router until `cancel` fires, honoring the
/// bounded shutdown sequence in §5 via axum's graceful shutdown.
pub async fn run(state: Arc<AppState>, bind_addr: &str, port: u16, cancel: tokio_util::sync::CancellationToken) -> std::io::Result<()> {
    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(component = "api", %addr, "listening");

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
