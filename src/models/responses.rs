//! Response DTOs for the image service API
//!
//! Defines the structure of outgoing HTTP response bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{CacheEntry, CacheStats};
use crate::registry::Image;
use crate::tasks::Task;

/// Response body for GET /v2/images
#[derive(Debug, Clone, Serialize)]
pub struct ImageListResponse {
    pub images: Vec<Image>,
}

/// Response body for GET /v2/tasks
#[derive(Debug, Clone, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<Task>,
}

/// One cached image in GET /v2/cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedImage {
    pub image_id: Uuid,
    pub size: u64,
    pub hits: u64,
    pub last_accessed: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl From<CacheEntry> for CachedImage {
    fn from(entry: CacheEntry) -> Self {
        Self {
            image_id: entry.image_id,
            size: entry.size_bytes,
            hits: entry.hit_count,
            last_accessed: entry.last_accessed_at,
            last_modified: entry.created_at,
        }
    }
}

/// Response body for GET /v2/cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheListResponse {
    pub cached_images: Vec<CachedImage>,
    pub queued_images: Vec<Uuid>,
}

/// Response body for DELETE /v2/cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClearCacheResponse {
    pub cached_removed: usize,
    pub queued_removed: usize,
}

/// Discovery value list, as used by the info endpoints
#[derive(Debug, Clone, Serialize)]
pub struct ValueList {
    pub description: String,
    #[serde(rename = "type")]
    pub value_type: String,
    pub value: Vec<String>,
}

/// Response body for GET /v2/info/import
#[derive(Debug, Clone, Serialize)]
pub struct ImportInfoResponse {
    #[serde(rename = "import-methods")]
    pub import_methods: ValueList,
}

impl ImportInfoResponse {
    pub fn new(methods: &[String]) -> Self {
        Self {
            import_methods: ValueList {
                description: "Import methods available.".to_string(),
                value_type: "array".to_string(),
                value: methods.to_vec(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
}

/// Response body for GET /v2/info/stores
#[derive(Debug, Clone, Serialize)]
pub struct StoresResponse {
    pub stores: Vec<StoreInfo>,
}

/// Response body for the stats endpoint (GET /stats)
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// Reads served from the cache
    pub hits: u64,
    /// Reads that fell through to a backing store
    pub misses: u64,
    /// Images evicted by the pruner
    pub evictions: u64,
    pub writes: u64,
    pub write_failures: u64,
    /// Images currently cached
    pub total_entries: usize,
    /// Bytes currently cached
    pub total_bytes: u64,
    /// Cache ceiling in bytes
    pub max_size: u64,
    /// Hit rate (hits / (hits + misses))
    pub hit_rate: f64,
}

impl StatsResponse {
    /// Creates a new StatsResponse from cache statistics
    pub fn new(stats: &CacheStats, max_size: u64) -> Self {
        Self {
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            writes: stats.writes,
            write_failures: stats.write_failures,
            total_entries: stats.total_entries,
            total_bytes: stats.total_bytes,
            max_size,
            hit_rate: stats.hit_rate(),
        }
    }
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}
