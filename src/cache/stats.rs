//! Cache Statistics Module
//!
//! Tracks cache performance metrics including hits, misses, and evictions.

use serde::Serialize;

// == Cache Stats ==
/// Tracks cache performance metrics for this process.
///
/// Counters are per process; `total_entries` and `total_bytes` are filled in
/// from the index when a snapshot is taken.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Number of reads served from the cache
    pub hits: u64,
    /// Number of reads that had to go to the backing store
    pub misses: u64,
    /// Number of completed write-through and prefetch writes
    pub writes: u64,
    /// Number of writes that failed and left an invalid entry
    pub write_failures: u64,
    /// Number of entries removed by the pruner
    pub evictions: u64,
    /// Current number of cached images
    pub total_entries: usize,
    /// Current aggregate size of cached images in bytes
    pub total_bytes: u64,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_write(&mut self) {
        self.writes += 1;
    }

    pub fn record_write_failure(&mut self) {
        self.write_failures += 1;
    }

    pub fn record_evictions(&mut self, count: u64) {
        self.evictions += count;
    }
}
