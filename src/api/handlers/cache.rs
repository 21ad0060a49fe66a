//! Cache management endpoints.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use tracing::info;
use uuid::Uuid;

use super::{with_cache, AppState};
use crate::error::{Result, ServiceError};
use crate::models::{CacheListResponse, CachedImage, ClearCacheResponse, ClearTarget};

/// Handler for GET /v2/cache
pub async fn list_cache_handler(State(state): State<AppState>) -> Result<Json<CacheListResponse>> {
    let (cached, queued) = with_cache(&state.cache, |cache| {
        Ok((cache.list_cached()?, cache.list_queued()?))
    })
    .await?;

    Ok(Json(CacheListResponse {
        cached_images: cached.into_iter().map(CachedImage::from).collect(),
        queued_images: queued.into_iter().map(|e| e.image_id).collect(),
    }))
}

/// Handler for PUT /v2/cache/:id
///
/// Queues an existing image for the prefetcher. Queuing an image that is
/// already cached or queued is accepted and changes nothing.
pub async fn queue_image_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.registry.get_image(id)?;
    let queued = with_cache(&state.cache, move |cache| cache.queue(id)).await?;
    if queued {
        info!(image_id = %id, "image queued for caching");
    }
    Ok(StatusCode::ACCEPTED)
}

/// Handler for DELETE /v2/cache/:id
///
/// Drops the image from the cache and from the queue.
pub async fn uncache_image_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    let removed = with_cache(&state.cache, move |cache| cache.purge_image(id)).await?;
    if !removed {
        return Err(ServiceError::NotFound(format!(
            "image {id} is neither cached nor queued"
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for DELETE /v2/cache
///
/// Clears cached images, queued images or both, as selected by the
/// `x-image-cache-clear-target` header (default both).
pub async fn clear_cache_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ClearCacheResponse>> {
    let raw = headers
        .get(ClearTarget::HEADER)
        .map(|v| {
            v.to_str()
                .map_err(|_| ServiceError::InvalidRequest(format!("invalid {} header", ClearTarget::HEADER)))
        })
        .transpose()?;
    let target = ClearTarget::from_header(raw)?;

    let report = with_cache(&state.cache, move |cache| {
        let mut report = ClearCacheResponse::default();
        if target.clears_cache() {
            report.cached_removed = cache.delete_all_cached()?;
        }
        if target.clears_queue() {
            report.queued_removed = cache.delete_all_queued()?;
        }
        Ok(report)
    })
    .await?;

    info!(
        cached = report.cached_removed,
        queued = report.queued_removed,
        "cache cleared"
    );
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::super::testing::test_state;
    use super::*;
    use crate::registry::NewImage;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn test_queue_requires_known_image() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;

        let result = queue_image_handler(State(state), Path(Uuid::new_v4())).await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_queue_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let id = state.registry.create_image(NewImage::default()).unwrap().id;

        let status = queue_image_handler(State(state.clone()), Path(id))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let listing = list_cache_handler(State(state)).await.unwrap();
        assert_eq!(listing.queued_images, vec![id]);
        assert!(listing.cached_images.is_empty());
    }

    #[tokio::test]
    async fn test_clear_queue_only_keeps_cached_images() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let cached = Uuid::new_v4();
        state.cache.write(cached, b"data").unwrap();
        state.cache.queue(Uuid::new_v4()).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(ClearTarget::HEADER, HeaderValue::from_static("queue"));
        let report = clear_cache_handler(State(state.clone()), headers)
            .await
            .unwrap();

        assert_eq!(report.cached_removed, 0);
        assert_eq!(report.queued_removed, 1);
        assert!(state.cache.is_cached(cached).unwrap());
    }

    #[tokio::test]
    async fn test_uncache_unknown_image() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;

        let result = uncache_image_handler(State(state), Path(Uuid::new_v4())).await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }
}
