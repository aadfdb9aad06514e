//! Application setup and server configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Extension},
    http::{header::CONTENT_TYPE, Method},
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::clients::ClientRegistry;
use crate::kernel::storage::MeasurementStore;
use crate::server::routes::{
    debug_stream_clients_handler, health_handler, stream_handler, upload_image_handler,
};

/// Shared application state
#[derive(Clone)]
pub struct AxumAppState {
    pub db_pool: PgPool,
    pub registry: Arc<ClientRegistry>,
    pub store: Arc<dyn MeasurementStore>,
    pub heartbeat_interval: Duration,
}

/// Build the Axum application router.
///
/// The SSE endpoint, the upload producer, the diagnostic surface, and the
/// health check all share the registry and store through [`AxumAppState`].
pub fn build_app(
    pool: PgPool,
    registry: Arc<ClientRegistry>,
    store: Arc<dyn MeasurementStore>,
    heartbeat_interval: Duration,
) -> Router {
    let app_state = AxumAppState {
        db_pool: pool,
        registry,
        store,
        heartbeat_interval,
    };

    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route("/stream", get(stream_handler))
        .route("/upload_image", post(upload_image_handler))
        .route("/debug/stream_clients", get(debug_stream_clients_handler))
        .route("/health", get(health_handler))
        // Base64 image bodies can easily exceed axum's 2 MB default
        .layer(DefaultBodyLimit::max(16 * 1024 * 1024))
        .layer(Extension(app_state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
