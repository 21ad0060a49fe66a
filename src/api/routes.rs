//! API Routes
//!
//! Configures the Axum router with all image service endpoints.

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    clear_cache_handler, create_image_handler, create_task_handler, delete_image_handler,
    download_image_handler, get_image_handler, get_task_handler, health_handler,
    import_image_handler, import_info_handler, list_cache_handler, list_images_handler,
    list_tasks_handler, queue_image_handler, stage_image_handler, stats_handler,
    stores_info_handler, uncache_image_handler, upload_image_handler, AppState,
};

/// Creates the main router with all endpoints configured.
///
/// # Middleware
/// - Body limit: request bodies up to `image_size_cap` bytes
/// - CORS: Allows any origin (configurable for production)
/// - Tracing: Logs all requests for debugging
pub fn create_router(state: AppState) -> Router {
    // Configure CORS middleware
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = usize::try_from(state.config.image_size_cap).unwrap_or(usize::MAX);

    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        // Images
        .route("/v2/images", post(create_image_handler).get(list_images_handler))
        .route(
            "/v2/images/:id",
            get(get_image_handler).delete(delete_image_handler),
        )
        .route(
            "/v2/images/:id/file",
            put(upload_image_handler).get(download_image_handler),
        )
        .route("/v2/images/:id/stage", put(stage_image_handler))
        .route("/v2/images/:id/import", post(import_image_handler))
        // Discovery
        .route("/v2/info/import", get(import_info_handler))
        .route("/v2/info/stores", get(stores_info_handler))
        // Tasks
        .route("/v2/tasks", post(create_task_handler).get(list_tasks_handler))
        .route("/v2/tasks/:id", get(get_task_handler))
        // Cache management
        .route("/v2/cache", get(list_cache_handler).delete(clear_cache_handler))
        .route(
            "/v2/cache/:id",
            put(queue_image_handler).delete(uncache_image_handler),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
