//! Extended-attribute cache index.
//!
//! Metadata lives in `user.image_service.*` attributes on the entry's own
//! file, so the index can never refer to a file that is gone. A file that
//! carries no `state` attribute was never properly recorded and is not part
//! of the index. The filesystem must support user extended attributes.

use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::CacheDriver;
use crate::cache::{CacheEntry, CacheLayout, EntryState};
use crate::clock;
use crate::error::{Result, ServiceError};

const ATTR_STATE: &str = "user.image_service.state";
const ATTR_SIZE: &str = "user.image_service.size";
const ATTR_CREATED: &str = "user.image_service.created_at";
const ATTR_ACCESSED: &str = "user.image_service.last_accessed_at";
const ATTR_HITS: &str = "user.image_service.hit_count";

const ALL_ATTRS: [&str; 5] = [ATTR_STATE, ATTR_SIZE, ATTR_CREATED, ATTR_ACCESSED, ATTR_HITS];

/// Lookup order when resolving an image id to its file.
const SEARCH_ORDER: [EntryState; 4] = [
    EntryState::Cached,
    EntryState::Caching,
    EntryState::Invalid,
    EntryState::Queued,
];

/// Cache index stored as extended attributes on the cached files.
#[derive(Debug)]
pub struct XattrDriver {
    layout: CacheLayout,
}

impl XattrDriver {
    /// Creates the driver, failing early when the cache directory's
    /// filesystem rejects user extended attributes.
    pub fn open(layout: CacheLayout) -> Result<Self> {
        layout.ensure_dirs()?;
        if !::xattr::SUPPORTED_PLATFORM {
            return Err(ServiceError::InvalidRequest(
                "extended attributes are not supported on this platform".to_string(),
            ));
        }

        let marker = layout.root().join(".xattr-check");
        std::fs::write(&marker, b"")?;
        let outcome = ::xattr::set(&marker, ATTR_STATE, b"check");
        let _ = std::fs::remove_file(&marker);
        outcome.map_err(|e| {
            ServiceError::InvalidRequest(format!(
                "cache directory {} does not support user extended attributes: {e}",
                layout.root().display()
            ))
        })?;

        Ok(Self { layout })
    }

    fn locate(&self, image_id: Uuid) -> Option<PathBuf> {
        SEARCH_ORDER
            .iter()
            .map(|state| self.layout.path_for(*state, image_id))
            .find(|path| path.is_file())
    }

    fn read_entry(&self, image_id: Uuid, path: &Path) -> Result<Option<CacheEntry>> {
        let Some(state) = read_attr(path, ATTR_STATE)? else {
            return Ok(None);
        };
        let parse_i64 = |name: &str| -> Result<i64> {
            Ok(read_attr(path, name)?
                .and_then(|v| v.parse().ok())
                .unwrap_or_default())
        };

        Ok(Some(CacheEntry {
            image_id,
            size_bytes: parse_i64(ATTR_SIZE)?.max(0) as u64,
            created_at: clock::from_millis(parse_i64(ATTR_CREATED)?),
            last_accessed_at: clock::from_millis(parse_i64(ATTR_ACCESSED)?),
            hit_count: parse_i64(ATTR_HITS)?.max(0) as u64,
            state: state.parse()?,
        }))
    }
}

fn read_attr(path: &Path, name: &str) -> Result<Option<String>> {
    match ::xattr::get(path, name) {
        Ok(value) => Ok(value.map(|v| String::from_utf8_lossy(&v).into_owned())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_attrs(path: &Path, entry: &CacheEntry) -> Result<()> {
    let values = [
        (ATTR_SIZE, entry.size_bytes.to_string()),
        (ATTR_CREATED, clock::to_millis(entry.created_at).to_string()),
        (ATTR_ACCESSED, clock::to_millis(entry.last_accessed_at).to_string()),
        (ATTR_HITS, entry.hit_count.to_string()),
        // Written last: its presence marks the record as complete.
        (ATTR_STATE, entry.state.as_str().to_string()),
    ];
    for (name, value) in values {
        ::xattr::set(path, name, value.as_bytes())?;
    }
    Ok(())
}

impl CacheDriver for XattrDriver {
    fn name(&self) -> &'static str {
        "xattr"
    }

    fn get(&self, image_id: Uuid) -> Result<Option<CacheEntry>> {
        match self.locate(image_id) {
            Some(path) => self.read_entry(image_id, &path),
            None => Ok(None),
        }
    }

    fn list(&self, state: Option<EntryState>) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        for file in self.layout.scan()? {
            // Files can disappear between the scan and the attribute read.
            let entry = match self.read_entry(file.image_id, &file.path) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(ServiceError::Io(e)) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if state.map_or(true, |s| s == entry.state) {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|e| e.last_accessed_at);
        Ok(entries)
    }

    fn upsert(&self, entry: &CacheEntry) -> Result<()> {
        let path = self.layout.path_for(entry.state, entry.image_id);
        if !path.is_file() {
            return Err(ServiceError::Internal(format!(
                "no {} file for image {} at {}",
                entry.state,
                entry.image_id,
                path.display()
            )));
        }
        write_attrs(&path, entry)
    }

    fn touch(&self, image_id: Uuid) -> Result<Option<CacheEntry>> {
        let Some(path) = self.locate(image_id) else {
            return Ok(None);
        };
        let Some(mut entry) = self.read_entry(image_id, &path)? else {
            return Ok(None);
        };
        // Read-modify-write: concurrent hits on one image may undercount.
        entry.record_hit();
        ::xattr::set(&path, ATTR_HITS, entry.hit_count.to_string().as_bytes())?;
        ::xattr::set(
            &path,
            ATTR_ACCESSED,
            clock::to_millis(entry.last_accessed_at).to_string().as_bytes(),
        )?;
        Ok(Some(entry))
    }

    fn remove(&self, image_id: Uuid) -> Result<bool> {
        let Some(path) = self.locate(image_id) else {
            return Ok(false);
        };
        let had_entry = read_attr(&path, ATTR_STATE)?.is_some();
        for name in ALL_ATTRS {
            if read_attr(&path, name)?.is_some() {
                ::xattr::remove(&path, name)?;
            }
        }
        Ok(had_entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Returns None when the test filesystem has no user xattr support.
    /// Opens a driver over a temp directory, or reports the test as skipped
    /// when the filesystem holding it has no user xattr support.
    fn open_driver(test: &str) -> Option<(tempfile::TempDir, CacheLayout, XattrDriver)> {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path());
        match XattrDriver::open(layout.clone()) {
            Ok(driver) => Some((dir, layout, driver)),
            Err(e) => {
                eprintln!(
                    "SKIPPED {test}: no user xattr support under {}: {e}",
                    dir.path().display()
                );
                None
            }
        }
    }

    #[test]
    fn test_upsert_requires_file() {
        let Some((_dir, _layout, driver)) = open_driver("test_upsert_requires_file") else {
            return;
        };
        let entry = CacheEntry::new(Uuid::new_v4(), EntryState::Cached);
        assert!(driver.upsert(&entry).is_err());
    }

    #[test]
    fn test_upsert_get_and_touch() {
        let Some((_dir, layout, driver)) = open_driver("test_upsert_get_and_touch") else {
            return;
        };
        let entry = CacheEntry::new(Uuid::new_v4(), EntryState::Caching).into_cached(3);
        std::fs::write(layout.path_for(EntryState::Cached, entry.image_id), b"abc").unwrap();

        driver.upsert(&entry).unwrap();
        assert_eq!(driver.get(entry.image_id).unwrap(), Some(entry.clone()));

        let touched = driver.touch(entry.image_id).unwrap().unwrap();
        assert_eq!(touched.hit_count, 1);
        assert_eq!(driver.get(entry.image_id).unwrap().unwrap().hit_count, 1);
    }

    #[test]
    fn test_unrecorded_files_are_not_listed() {
        let Some((_dir, layout, driver)) = open_driver("test_unrecorded_files_are_not_listed")
        else {
            return;
        };
        let recorded = CacheEntry::new(Uuid::new_v4(), EntryState::Queued);
        std::fs::write(layout.path_for(EntryState::Queued, recorded.image_id), b"").unwrap();
        driver.upsert(&recorded).unwrap();

        let stray = Uuid::new_v4();
        std::fs::write(layout.path_for(EntryState::Cached, stray), b"junk").unwrap();

        let listed = driver.list(None).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].image_id, recorded.image_id);
        assert!(driver.get(stray).unwrap().is_none());
    }

    #[test]
    fn test_remove_strips_metadata() {
        let Some((_dir, layout, driver)) = open_driver("test_remove_strips_metadata") else {
            return;
        };
        let entry = CacheEntry::new(Uuid::new_v4(), EntryState::Cached);
        std::fs::write(layout.path_for(EntryState::Cached, entry.image_id), b"x").unwrap();
        driver.upsert(&entry).unwrap();

        assert!(driver.remove(entry.image_id).unwrap());
        assert!(driver.get(entry.image_id).unwrap().is_none());
        assert!(!driver.remove(Uuid::new_v4()).unwrap());
    }
}
