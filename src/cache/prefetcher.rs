//! Cache Prefetcher
//!
//! Fetches queued images from their backing store into the cache ahead of
//! demand.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::StoreRegistry;
use crate::cache::ImageCache;
use crate::error::{Result, ServiceError};
use crate::registry::{ImageStatus, Registry};

/// Outcome of a prefetch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchReport {
    pub cached: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Prefetcher {
    cache: Arc<ImageCache>,
    registry: Arc<Registry>,
    stores: StoreRegistry,
    concurrency: usize,
}

impl Prefetcher {
    pub fn new(
        cache: Arc<ImageCache>,
        registry: Arc<Registry>,
        stores: StoreRegistry,
        concurrency: usize,
    ) -> Self {
        Self {
            cache,
            registry,
            stores,
            concurrency: concurrency.max(1),
        }
    }

    /// Fetches every queued image, at most `concurrency` at a time. A failed
    /// image stays queued for the next pass.
    pub async fn run(&self) -> Result<PrefetchReport> {
        let queued: Vec<Uuid> = self
            .cache
            .list_queued()?
            .into_iter()
            .map(|e| e.image_id)
            .collect();
        if queued.is_empty() {
            debug!("prefetch: nothing queued");
            return Ok(PrefetchReport::default());
        }
        info!(queued = queued.len(), "prefetching queued images");

        let outcomes: Vec<(Uuid, Result<bool>)> = stream::iter(queued)
            .map(|id| {
                let this = self.clone();
                async move { (id, this.fetch(id).await) }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = PrefetchReport::default();
        for (image_id, outcome) in outcomes {
            match outcome {
                Ok(true) => report.cached += 1,
                Ok(false) => debug!(%image_id, "prefetch: already cached"),
                Err(e) => {
                    warn!(%image_id, error = %e, "prefetch failed");
                    report.failed += 1;
                }
            }
        }

        info!(cached = report.cached, failed = report.failed, "prefetch finished");
        Ok(report)
    }

    async fn fetch(&self, image_id: Uuid) -> Result<bool> {
        let image = match self.registry.get_image(image_id) {
            Ok(image) => image,
            Err(e) if e.is_not_found() => {
                // Deleted since it was queued; retrying cannot help.
                self.cache.dequeue(image_id)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if image.status != ImageStatus::Active {
            return Err(ServiceError::Conflict(format!(
                "image {image_id} is {}, not active",
                image.status
            )));
        }
        let location = image
            .locations
            .first()
            .ok_or_else(|| ServiceError::Conflict(format!("image {image_id} has no locations")))?;

        let data = self.stores.get(&location.store)?.get(&location.key).await?;

        let cache = self.cache.clone();
        tokio::task::spawn_blocking(move || cache.write(image_id, &data))
            .await
            .map_err(|e| ServiceError::Internal(format!("cache write task failed: {e}")))?
    }
}
