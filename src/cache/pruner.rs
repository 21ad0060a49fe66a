//! Cache Pruner
//!
//! Brings the cache back under its ceiling by evicting least recently used
//! images. Intended to be run periodically (cron or the server's maintenance
//! loop), never on the request path.

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::lru::eviction_candidates;
use crate::cache::{ImageCache, MaintenanceLock};
use crate::error::Result;

/// Outcome of a pruner run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub entries_removed: usize,
    pub bytes_freed: u64,
    pub total_before: u64,
    pub total_after: u64,
}

/// Evicts cached images until the aggregate size is within the ceiling.
pub struct Pruner<'a> {
    cache: &'a ImageCache,
}

impl<'a> Pruner<'a> {
    pub fn new(cache: &'a ImageCache) -> Self {
        Self { cache }
    }

    /// Runs one pruning pass under the maintenance lock.
    ///
    /// Entries are removed in LRU order (see [`crate::cache::lru`]). An entry
    /// that alone exceeds the ceiling is evicted like any other, so the cache
    /// always ends at or below the ceiling.
    pub fn run(&self) -> Result<PruneReport> {
        let _lock = MaintenanceLock::acquire(
            self.cache.layout().root(),
            "pruner",
            self.cache.stall_time(),
        )?;

        let max_size = self.cache.max_size();
        let candidates = eviction_candidates(self.cache.list_cached()?);
        let total_before: u64 = candidates.iter().map(|e| e.size_bytes).sum();

        let mut report = PruneReport {
            total_before,
            total_after: total_before,
            ..PruneReport::default()
        };

        if total_before <= max_size {
            debug!(total = total_before, max_size, "cache within ceiling, nothing to prune");
            return Ok(report);
        }

        for entry in candidates {
            if report.total_after <= max_size {
                break;
            }
            self.cache.discard(&entry)?;
            report.total_after -= entry.size_bytes;
            report.bytes_freed += entry.size_bytes;
            report.entries_removed += 1;
            debug!(
                image_id = %entry.image_id,
                bytes = entry.size_bytes,
                hits = entry.hit_count,
                "pruned cached image"
            );
        }

        self.cache
            .with_stats(|stats| stats.record_evictions(report.entries_removed as u64));
        info!(
            removed = report.entries_removed,
            bytes_freed = report.bytes_freed,
            total_after = report.total_after,
            max_size,
            "cache pruned"
        );
        Ok(report)
    }
}
