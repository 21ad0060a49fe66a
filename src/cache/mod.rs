//! Cache Module
//!
//! Node-local image cache: an on-disk layout of image files, an index driver
//! tracking entry state, and the maintenance jobs (pruner, cleaner,
//! prefetcher) that keep the two bounded and consistent.

pub mod driver;
mod cleaner;
mod entry;
mod layout;
mod lock;
mod lru;
mod prefetcher;
mod pruner;
mod stats;
mod store;

#[cfg(test)]
pub(crate) mod testing;


// Re-export public types
pub use cleaner::{CleanReport, Cleaner};
pub use entry::{CacheEntry, EntryState};
pub use layout::{CacheLayout, ScannedFile};
pub use lock::MaintenanceLock;
pub use lru::{eviction_candidates, eviction_order};
pub use prefetcher::{PrefetchReport, Prefetcher};
pub use pruner::{PruneReport, Pruner};
pub use stats::CacheStats;
pub use store::ImageCache;
