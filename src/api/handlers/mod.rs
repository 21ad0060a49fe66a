//! API Handlers
//!
//! HTTP request handlers for each image service endpoint, grouped by
//! resource. Shared state and the discovery endpoints live here.

mod cache;
mod images;
mod tasks;

pub use cache::{clear_cache_handler, list_cache_handler, queue_image_handler, uncache_image_handler};
pub use images::{
    create_image_handler, delete_image_handler, download_image_handler, get_image_handler,
    import_image_handler, list_images_handler, stage_image_handler, upload_image_handler,
};
pub use tasks::{create_task_handler, get_task_handler, list_tasks_handler};

use std::sync::Arc;

use axum::{extract::State, Json};

use crate::backend::{StagingArea, StoreRegistry};
use crate::cache::ImageCache;
use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::models::{HealthResponse, ImportInfoResponse, StatsResponse, StoreInfo, StoresResponse};
use crate::registry::Registry;
use crate::tasks::{Importer, TaskExecutor};

/// Application state shared across all handlers.
///
/// Every component is behind an `Arc` (or is a cheap clone of one), so the
/// state is cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<ImageCache>,
    pub registry: Arc<Registry>,
    pub stores: StoreRegistry,
    pub importer: Importer,
    pub executor: Arc<TaskExecutor>,
}

impl AppState {
    /// Assembles the state from already opened components and starts the
    /// task executor. Must be called inside a tokio runtime.
    pub fn new(
        config: Config,
        cache: Arc<ImageCache>,
        registry: Arc<Registry>,
        stores: StoreRegistry,
        staging: StagingArea,
    ) -> Self {
        let importer = Importer::new(registry.clone(), stores.clone(), staging, &config);
        let executor = Arc::new(TaskExecutor::from_config(&config, registry.clone()));
        Self {
            config: Arc::new(config),
            cache,
            registry,
            stores,
            importer,
            executor,
        }
    }

    /// Opens the registry, the cache, the backing stores and the staging
    /// area described by the configuration.
    ///
    /// The registry schema is not touched; callers gate on
    /// [`crate::migration::Migrator::check_ready`].
    pub async fn from_config(config: &Config) -> Result<Self> {
        let registry = Arc::new(Registry::open(&config.database_path)?);
        let cache = Arc::new(ImageCache::open(config)?);
        let stores = StoreRegistry::from_config(config).await?;
        let staging = StagingArea::from_config(config).await?;
        Ok(Self::new(config.clone(), cache, registry, stores, staging))
    }

    /// How long finished tasks stay visible.
    pub fn task_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.config.task_time_to_live as i64)
    }
}

/// Runs blocking cache work off the async executor.
pub(crate) async fn with_cache<T, F>(cache: &Arc<ImageCache>, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&ImageCache) -> Result<T> + Send + 'static,
{
    let cache = cache.clone();
    tokio::task::spawn_blocking(move || work(&cache))
        .await
        .map_err(|e| ServiceError::Internal(format!("cache task failed: {e}")))?
}

/// Handler for GET /stats
///
/// Returns current cache statistics.
pub async fn stats_handler(State(state): State<AppState>) -> Result<Json<StatsResponse>> {
    let max_size = state.cache.max_size();
    let stats = with_cache(&state.cache, |cache| cache.stats()).await?;
    Ok(Json(StatsResponse::new(&stats, max_size)))
}

/// Handler for GET /health
///
/// Returns health status of the server.
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

/// Handler for GET /v2/info/import
pub async fn import_info_handler(State(state): State<AppState>) -> Json<ImportInfoResponse> {
    Json(ImportInfoResponse::new(state.importer.enabled_methods()))
}

/// Handler for GET /v2/info/stores
pub async fn stores_info_handler(State(state): State<AppState>) -> Json<StoresResponse> {
    let default = state.stores.default_name();
    let stores = state
        .stores
        .iter()
        .map(|store| StoreInfo {
            id: store.name().to_string(),
            kind: store.kind().to_string(),
            default: store.name() == default,
        })
        .collect();
    Json(StoresResponse { stores })
}
