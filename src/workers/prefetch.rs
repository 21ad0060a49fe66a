//! Prefetch Task
//!
//! Background task that periodically runs the cache prefetcher.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::Prefetcher;

/// Spawns a background task that runs a prefetch pass every `interval_secs`.
///
/// The returned handle is aborted during graceful shutdown.
pub fn spawn_prefetch_task(prefetcher: Prefetcher, interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(interval_secs);

    tokio::spawn(async move {
        info!(interval_secs, "starting cache prefetch task");

        loop {
            tokio::time::sleep(interval).await;

            match prefetcher.run().await {
                Ok(report) if report.cached + report.failed > 0 => {
                    info!(
                        cached = report.cached,
                        failed = report.failed,
                        "prefetch pass complete"
                    );
                }
                Ok(_) => debug!("prefetch pass: queue empty"),
                Err(e) => warn!(error = %e, "prefetch pass failed"),
            }
        }
    })
}
