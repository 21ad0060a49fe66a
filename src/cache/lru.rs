//! LRU Ordering Module
//!
//! Decides the order in which cached images are evicted by the pruner.

use std::cmp::Ordering;

use crate::cache::CacheEntry;

// == Eviction Order ==
/// Compares two entries for eviction: least recently accessed first.
///
/// Ties on `last_accessed_at` fall back to the older `created_at`, then to
/// the image id, so that every pruner run over the same index picks the same
/// victims.
pub fn eviction_order(a: &CacheEntry, b: &CacheEntry) -> Ordering {
    a.last_accessed_at
        .cmp(&b.last_accessed_at)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.image_id.cmp(&b.image_id))
}

/// Returns the `cached` entries in eviction order, oldest first.
pub fn eviction_candidates(entries: Vec<CacheEntry>) -> Vec<CacheEntry> {
    let mut candidates: Vec<CacheEntry> = entries.into_iter().filter(|e| e.is_cached()).collect();
    candidates.sort_by(eviction_order);
    candidates
}
