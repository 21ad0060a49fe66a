//! Maintenance Task
//!
//! Expires finished tasks and, with `cache_inline_maintenance`, prunes and
//! cleans the cache in-process instead of relying on cron.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CleanReport, Cleaner, ImageCache, PruneReport, Pruner};
use crate::clock;
use crate::error::{Result, ServiceError};
use crate::registry::Registry;

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub tasks_expired: usize,
    pub prune: Option<PruneReport>,
    pub clean: Option<CleanReport>,
}

/// Runs one maintenance pass. Cache jobs are skipped, not failed, when
/// another process holds the maintenance lock.
pub async fn run_maintenance(
    registry: &Registry,
    cache: &Arc<ImageCache>,
    inline_cache_maintenance: bool,
) -> Result<MaintenanceReport> {
    let mut report = MaintenanceReport {
        tasks_expired: registry.expire_tasks(clock::now())?,
        ..MaintenanceReport::default()
    };

    if inline_cache_maintenance {
        let cache = cache.clone();
        let (prune, clean) = tokio::task::spawn_blocking(move || {
            let prune = skip_if_locked(Pruner::new(&cache).run())?;
            let clean = skip_if_locked(Cleaner::new(&cache).run())?;
            Ok::<_, ServiceError>((prune, clean))
        })
        .await
        .map_err(|e| ServiceError::Internal(format!("maintenance task failed: {e}")))??;
        report.prune = prune;
        report.clean = clean;
    }

    Ok(report)
}

fn skip_if_locked<T>(outcome: Result<T>) -> Result<Option<T>> {
    match outcome {
        Ok(report) => Ok(Some(report)),
        Err(ServiceError::Conflict(msg)) => {
            debug!(reason = %msg, "cache maintenance skipped");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Spawns a background task that runs [`run_maintenance`] every
/// `interval_secs`.
///
/// The returned handle is aborted during graceful shutdown.
pub fn spawn_maintenance_task(
    registry: Arc<Registry>,
    cache: Arc<ImageCache>,
    interval_secs: u64,
    inline_cache_maintenance: bool,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(interval_secs);

    tokio::spawn(async move {
        info!(
            interval_secs,
            inline_cache_maintenance, "starting maintenance task"
        );

        loop {
            tokio::time::sleep(interval).await;

            match run_maintenance(&registry, &cache, inline_cache_maintenance).await {
                Ok(report) => {
                    if report.tasks_expired > 0 {
                        info!(expired = report.tasks_expired, "maintenance: tasks expired");
                    } else {
                        debug!("maintenance: no expired tasks");
                    }
                }
                Err(e) => warn!(error = %e, "maintenance pass failed"),
            }
        }
    })
}
