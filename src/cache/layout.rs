//! On-disk layout of a cache directory.
//!
//! ```text
//! <dir>/<image_id>               cached
//! <dir>/incomplete/<image_id>    caching, stalled
//! <dir>/invalid/<image_id>       invalid
//! <dir>/queue/<image_id>         queued (empty marker)
//! ```
//!
//! An entry's file location is a function of its state, which keeps at most
//! one file per image id in the tree.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use uuid::Uuid;

use crate::cache::EntryState;
use crate::error::Result;

const INCOMPLETE_DIR: &str = "incomplete";
const INVALID_DIR: &str = "invalid";
const QUEUE_DIR: &str = "queue";

/// A file found while scanning the cache tree.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub image_id: Uuid,
    /// State implied by the directory the file lives in
    pub state: EntryState,
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

// == Cache Layout ==
/// Resolves paths for cache entries under one root directory.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the root and state subdirectories.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.root.join(INCOMPLETE_DIR),
            self.root.join(INVALID_DIR),
            self.root.join(QUEUE_DIR),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file backing an entry in `state`.
    pub fn path_for(&self, state: EntryState, image_id: Uuid) -> PathBuf {
        let name = image_id.to_string();
        match state {
            EntryState::Cached => self.root.join(name),
            EntryState::Caching | EntryState::Stalled => self.root.join(INCOMPLETE_DIR).join(name),
            EntryState::Invalid => self.root.join(INVALID_DIR).join(name),
            EntryState::Queued => self.root.join(QUEUE_DIR).join(name),
        }
    }

    /// Scans every state directory. Files whose name is not an image id
    /// (the index database, the maintenance lock) are skipped.
    pub fn scan(&self) -> Result<Vec<ScannedFile>> {
        let mut found = Vec::new();
        for (dir, state) in [
            (self.root.clone(), EntryState::Cached),
            (self.root.join(INCOMPLETE_DIR), EntryState::Caching),
            (self.root.join(INVALID_DIR), EntryState::Invalid),
            (self.root.join(QUEUE_DIR), EntryState::Queued),
        ] {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let meta = entry.metadata()?;
                if !meta.is_file() {
                    continue;
                }
                let Some(image_id) = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| Uuid::parse_str(name).ok())
                else {
                    continue;
                };
                found.push(ScannedFile {
                    image_id,
                    state,
                    path: entry.path(),
                    size: meta.len(),
                    modified: meta.modified()?,
                });
            }
        }
        Ok(found)
    }
}
