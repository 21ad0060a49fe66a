//! Image Cache Module
//!
//! Main cache engine: moves image files through the cache layout and keeps
//! the index driver in step with the filesystem.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::driver::{CacheDriver, SqliteDriver, XattrDriver};
use crate::cache::{CacheEntry, CacheLayout, CacheStats, EntryState};
use crate::config::{CacheDriverKind, Config};
use crate::error::{Result, ServiceError};

// == Image Cache ==
/// Node-local cache of image data.
///
/// All methods take `&self`; the driver serializes index access, and file
/// state changes are single renames or `create_new` claims, so one instance
/// can be shared through an `Arc` by request handlers and background workers.
#[derive(Debug)]
pub struct ImageCache {
    layout: CacheLayout,
    driver: Box<dyn CacheDriver>,
    /// Cache ceiling in bytes, enforced by the pruner only
    max_size: u64,
    /// Age after which an incomplete write is considered stalled
    stall_time: Duration,
    stats: Mutex<CacheStats>,
}

impl ImageCache {
    // == Constructor ==
    /// Opens the cache described by the configuration, creating directories
    /// and the index as needed.
    pub fn open(config: &Config) -> Result<Self> {
        let layout = CacheLayout::new(&config.image_cache_dir);
        layout.ensure_dirs()?;

        let driver: Box<dyn CacheDriver> = match config.image_cache_driver {
            CacheDriverKind::Sqlite => Box::new(SqliteDriver::open(&config.cache_index_path())?),
            CacheDriverKind::Xattr => Box::new(XattrDriver::open(layout.clone())?),
        };

        info!(
            dir = %layout.root().display(),
            driver = driver.name(),
            max_size = config.image_cache_max_size,
            "image cache opened"
        );

        Ok(Self::with_driver(
            layout,
            driver,
            config.image_cache_max_size,
            config.stall_time(),
        ))
    }

    /// Builds a cache over an already opened driver.
    pub fn with_driver(
        layout: CacheLayout,
        driver: Box<dyn CacheDriver>,
        max_size: u64,
        stall_time: Duration,
    ) -> Self {
        Self {
            layout,
            driver,
            max_size,
            stall_time,
            stats: Mutex::new(CacheStats::new()),
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn driver(&self) -> &dyn CacheDriver {
        self.driver.as_ref()
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn stall_time(&self) -> Duration {
        self.stall_time
    }

    // == Lookups ==
    pub fn entry(&self, image_id: Uuid) -> Result<Option<CacheEntry>> {
        self.driver.get(image_id)
    }

    pub fn is_cached(&self, image_id: Uuid) -> Result<bool> {
        Ok(matches!(self.entry(image_id)?, Some(e) if e.state == EntryState::Cached))
    }

    pub fn is_queued(&self, image_id: Uuid) -> Result<bool> {
        Ok(matches!(self.entry(image_id)?, Some(e) if e.state == EntryState::Queued))
    }

    pub fn list_cached(&self) -> Result<Vec<CacheEntry>> {
        self.driver.list(Some(EntryState::Cached))
    }

    pub fn list_queued(&self) -> Result<Vec<CacheEntry>> {
        self.driver.list(Some(EntryState::Queued))
    }

    /// Aggregate size of all cached images.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list_cached()?.iter().map(|e| e.size_bytes).sum())
    }

    // == Read ==
    /// Serves an image from the cache.
    ///
    /// Returns `None` on a miss. A cached entry whose file has vanished is
    /// dropped from the index and counted as a miss.
    pub fn read(&self, image_id: Uuid) -> Result<Option<Vec<u8>>> {
        let cached = matches!(self.driver.get(image_id)?, Some(e) if e.is_cached());
        if !cached {
            self.with_stats(CacheStats::record_miss);
            return Ok(None);
        }

        match fs::read(self.layout.path_for(EntryState::Cached, image_id)) {
            Ok(data) => {
                self.driver.touch(image_id)?;
                self.with_stats(CacheStats::record_hit);
                debug!(%image_id, bytes = data.len(), "served image from cache");
                Ok(Some(data))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(%image_id, "cached file missing, dropping index entry");
                self.driver.remove(image_id)?;
                self.with_stats(CacheStats::record_miss);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    // == Write ==
    /// Writes image data into the cache.
    ///
    /// There is no admission control: the write proceeds even when it takes
    /// the cache over its ceiling. Returns `false` without writing when the
    /// image is already cached or another writer holds the incomplete file.
    /// On failure the partial file is moved to `invalid/`.
    pub fn write(&self, image_id: Uuid, data: &[u8]) -> Result<bool> {
        let existing = self.driver.get(image_id)?;
        if matches!(&existing, Some(e) if e.is_cached()) {
            return Ok(false);
        }

        let incomplete = self.layout.path_for(EntryState::Caching, image_id);
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&incomplete)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(%image_id, "image is already being cached");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        // A queued entry keeps its history as it moves on to caching.
        let entry = match existing {
            Some(e) if e.state == EntryState::Queued => e.with_state(EntryState::Caching),
            _ => CacheEntry::new(image_id, EntryState::Caching),
        };
        if let Err(e) = self.driver.upsert(&entry) {
            drop(file);
            let _ = remove_if_exists(&incomplete);
            return Err(e);
        }
        remove_if_exists(&self.layout.path_for(EntryState::Queued, image_id))?;

        let written = file
            .write_all(data)
            .and_then(|_| file.sync_all())
            .and_then(|_| {
                fs::rename(&incomplete, self.layout.path_for(EntryState::Cached, image_id))
            });

        match written {
            Ok(()) => {
                self.driver.upsert(&entry.into_cached(data.len() as u64))?;
                self.with_stats(CacheStats::record_write);
                info!(%image_id, bytes = data.len(), "image cached");
                Ok(true)
            }
            Err(e) => {
                warn!(%image_id, error = %e, "cache write failed, marking entry invalid");
                self.with_stats(CacheStats::record_write_failure);
                self.mark_invalid(entry);
                Err(e.into())
            }
        }
    }

    fn mark_invalid(&self, entry: CacheEntry) {
        let image_id = entry.image_id;
        let moved = fs::rename(
            self.layout.path_for(EntryState::Caching, image_id),
            self.layout.path_for(EntryState::Invalid, image_id),
        );
        let recorded = match moved {
            Ok(()) => self.driver.upsert(&entry.with_state(EntryState::Invalid)),
            Err(_) => self.driver.remove(image_id).map(|_| ()),
        };
        if let Err(e) = recorded {
            warn!(%image_id, error = %e, "could not record invalid cache entry");
        }
    }

    // == Queue ==
    /// Queues an image for the prefetcher.
    ///
    /// Returns `false` if the image already has an entry in any state.
    pub fn queue(&self, image_id: Uuid) -> Result<bool> {
        if self.driver.get(image_id)?.is_some() {
            return Ok(false);
        }

        let marker = self.layout.path_for(EntryState::Queued, image_id);
        match OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.driver.upsert(&CacheEntry::new(image_id, EntryState::Queued)) {
            let _ = remove_if_exists(&marker);
            return Err(e);
        }
        info!(%image_id, "image queued for caching");
        Ok(true)
    }

    /// Removes a queued image. Returns true if it was queued.
    pub fn dequeue(&self, image_id: Uuid) -> Result<bool> {
        match self.driver.get(image_id)? {
            Some(e) if e.state == EntryState::Queued => {
                self.discard(&e)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Removes every queued image. Returns the number removed.
    pub fn delete_all_queued(&self) -> Result<usize> {
        let queued = self.list_queued()?;
        for entry in &queued {
            self.discard(entry)?;
        }
        Ok(queued.len())
    }

    // == Delete ==
    /// Removes a cached image. Returns true if it was cached.
    pub fn delete_cached(&self, image_id: Uuid) -> Result<bool> {
        match self.driver.get(image_id)? {
            Some(e) if e.is_cached() => {
                self.discard(&e)?;
                info!(%image_id, "cached image deleted");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Removes every cached image. Returns the number removed.
    pub fn delete_all_cached(&self) -> Result<usize> {
        let cached = self.list_cached()?;
        for entry in &cached {
            self.discard(entry)?;
        }
        info!(count = cached.len(), "all cached images deleted");
        Ok(cached.len())
    }

    /// Drops any entry for the image, whatever its state.
    pub fn purge_image(&self, image_id: Uuid) -> Result<bool> {
        match self.driver.get(image_id)? {
            Some(entry) => {
                self.discard(&entry)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes an entry's metadata and then its file.
    pub(crate) fn discard(&self, entry: &CacheEntry) -> Result<()> {
        self.driver.remove(entry.image_id)?;
        remove_if_exists(&self.layout.path_for(entry.state, entry.image_id))?;
        Ok(())
    }

    // == Stats ==
    /// Returns a snapshot of the cache statistics.
    pub fn stats(&self) -> Result<CacheStats> {
        let cached = self.list_cached()?;
        let mut stats = self
            .stats
            .lock()
            .map_err(|_| ServiceError::Internal("cache stats lock poisoned".to_string()))?
            .clone();
        stats.total_entries = cached.len();
        stats.total_bytes = cached.iter().map(|e| e.size_bytes).sum();
        Ok(stats)
    }

    pub(crate) fn with_stats(&self, f: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

/// Deletes a file, treating a missing file as success. Returns true if a
/// file was removed.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::open_cache;

    #[test]
    fn test_write_then_read_hits() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), 1024);
        let id = Uuid::new_v4();

        assert!(cache.read(id).unwrap().is_none());
        assert!(cache.write(id, b"image-bytes").unwrap());
        assert_eq!(cache.read(id).unwrap().unwrap(), b"image-bytes");

        let entry = cache.entry(id).unwrap().unwrap();
        assert_eq!(entry.state, EntryState::Cached);
        assert_eq!(entry.size_bytes, 11);
        assert_eq!(entry.hit_count, 1);

        let stats = cache.stats().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.total_bytes, 11);
    }

    #[test]
    fn test_write_is_not_repeated() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), 1024);
        let id = Uuid::new_v4();

        assert!(cache.write(id, b"first").unwrap());
        assert!(!cache.write(id, b"second").unwrap());
        assert_eq!(cache.read(id).unwrap().unwrap(), b"first");
    }

    #[test]
    fn test_write_skips_when_another_writer_holds_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), 1024);
        let id = Uuid::new_v4();
        fs::write(cache.layout().path_for(EntryState::Caching, id), b"partial").unwrap();

        assert!(!cache.write(id, b"data").unwrap());
        assert!(!cache.is_cached(id).unwrap());
    }

    #[test]
    fn test_write_ignores_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), 4);
        let id = Uuid::new_v4();

        assert!(cache.write(id, b"larger than the ceiling").unwrap());
        assert!(cache.total_size().unwrap() > cache.max_size());
    }

    #[test]
    fn test_queue_and_dequeue() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), 1024);
        let id = Uuid::new_v4();

        assert!(cache.queue(id).unwrap());
        assert!(!cache.queue(id).unwrap());
        assert!(cache.is_queued(id).unwrap());
        assert!(cache.layout().path_for(EntryState::Queued, id).exists());

        assert!(cache.dequeue(id).unwrap());
        assert!(!cache.dequeue(id).unwrap());
        assert!(!cache.layout().path_for(EntryState::Queued, id).exists());
    }

    #[test]
    fn test_write_consumes_queue_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), 1024);
        let id = Uuid::new_v4();

        cache.queue(id).unwrap();
        let queued_at = cache.entry(id).unwrap().unwrap().created_at;
        cache.write(id, b"data").unwrap();

        let entry = cache.entry(id).unwrap().unwrap();
        assert_eq!(entry.state, EntryState::Cached);
        assert_eq!(entry.created_at, queued_at);
        assert!(cache.list_queued().unwrap().is_empty());
        assert!(!cache.layout().path_for(EntryState::Queued, id).exists());
    }

    #[test]
    fn test_queue_refuses_cached_image() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), 1024);
        let id = Uuid::new_v4();

        cache.write(id, b"data").unwrap();
        assert!(!cache.queue(id).unwrap());
    }

    #[test]
    fn test_delete_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), 1024);
        let id = Uuid::new_v4();

        cache.write(id, b"data").unwrap();
        assert!(cache.delete_cached(id).unwrap());
        assert!(!cache.delete_cached(id).unwrap());
        assert!(!cache.layout().path_for(EntryState::Cached, id).exists());
        assert!(cache.read(id).unwrap().is_none());
    }

    #[test]
    fn test_delete_all() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), 1024);

        for _ in 0..3 {
            cache.write(Uuid::new_v4(), b"data").unwrap();
        }
        for _ in 0..2 {
            cache.queue(Uuid::new_v4()).unwrap();
        }

        assert_eq!(cache.delete_all_cached().unwrap(), 3);
        assert_eq!(cache.list_queued().unwrap().len(), 2);
        assert_eq!(cache.delete_all_queued().unwrap(), 2);
        assert!(cache.driver().list(None).unwrap().is_empty());
    }

    #[test]
    fn test_read_with_missing_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open_cache(dir.path(), 1024);
        let id = Uuid::new_v4();

        cache.write(id, b"data").unwrap();
        fs::remove_file(cache.layout().path_for(EntryState::Cached, id)).unwrap();

        assert!(cache.read(id).unwrap().is_none());
        assert!(cache.entry(id).unwrap().is_none());
    }
}
