//! Shared fixtures for cache unit tests.

use std::path::Path;
use std::time::Duration;

use crate::cache::driver::SqliteDriver;
use crate::cache::{CacheLayout, ImageCache};

/// Opens a SQLite-indexed cache in `dir` with a one hour stall time.
pub(crate) fn open_cache(dir: &Path, max_size: u64) -> ImageCache {
    open_cache_with_stall(dir, max_size, Duration::from_secs(3600))
}

pub(crate) fn open_cache_with_stall(dir: &Path, max_size: u64, stall: Duration) -> ImageCache {
    let layout = CacheLayout::new(dir);
    layout.ensure_dirs().unwrap();
    let driver = SqliteDriver::open(&dir.join("cache.db")).unwrap();
    ImageCache::with_driver(layout, Box::new(driver), max_size, stall)
}
