//! Cache Cleaner
//!
//! Removes stalled writes and invalid entries, and reconciles the index with
//! the files actually present in the cache directory.

use std::collections::HashMap;
use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::store::remove_if_exists;
use crate::cache::{CacheEntry, EntryState, ImageCache, MaintenanceLock};
use crate::error::Result;

/// Outcome of a cleaner run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    /// Incomplete writes older than the stall time
    pub stalled_removed: usize,
    /// Invalid entries and index records without a file
    pub invalid_removed: usize,
    /// Files with no matching index record
    pub orphans_removed: usize,
}

/// Directory an entry in `state` lives in, expressed as the scan state.
fn dir_state(state: EntryState) -> EntryState {
    match state {
        EntryState::Stalled => EntryState::Caching,
        other => other,
    }
}

/// Whether a file found in `dir` belongs to an entry in `state`. A writer
/// renames its file into the cached directory before recording the entry as
/// cached.
fn file_matches(state: EntryState, dir: EntryState) -> bool {
    dir_state(state) == dir || (state == EntryState::Caching && dir == EntryState::Cached)
}

pub struct Cleaner<'a> {
    cache: &'a ImageCache,
}

impl<'a> Cleaner<'a> {
    pub fn new(cache: &'a ImageCache) -> Self {
        Self { cache }
    }

    /// Runs one cleaning pass under the maintenance lock.
    pub fn run(&self) -> Result<CleanReport> {
        let _lock = MaintenanceLock::acquire(
            self.cache.layout().root(),
            "cleaner",
            self.cache.stall_time(),
        )?;

        let mut report = CleanReport::default();
        for entry in self.cache.driver().list(None)? {
            self.clean_entry(entry, &mut report)?;
        }
        let indexed: HashMap<Uuid, EntryState> = self
            .cache
            .driver()
            .list(None)?
            .into_iter()
            .map(|e| (e.image_id, e.state))
            .collect();
        self.remove_orphans(&indexed, &mut report)?;

        info!(
            stalled = report.stalled_removed,
            invalid = report.invalid_removed,
            orphans = report.orphans_removed,
            "cache cleaned"
        );
        Ok(report)
    }

    fn clean_entry(&self, entry: CacheEntry, report: &mut CleanReport) -> Result<()> {
        let layout = self.cache.layout();
        let path = layout.path_for(entry.state, entry.image_id);

        match entry.state {
            EntryState::Stalled => {
                self.cache.discard(&entry)?;
                report.stalled_removed += 1;
            }
            EntryState::Invalid => {
                self.cache.discard(&entry)?;
                report.invalid_removed += 1;
                debug!(image_id = %entry.image_id, "removed invalid cache entry");
            }
            EntryState::Caching => match file_age(&path) {
                None => {
                    self.cache.driver().remove(entry.image_id)?;
                    report.invalid_removed += 1;
                }
                Some(age) if age >= self.cache.stall_time() => {
                    warn!(
                        image_id = %entry.image_id,
                        age_secs = age.as_secs(),
                        "cache write stalled, removing partial file"
                    );
                    let stalled = entry.with_state(EntryState::Stalled);
                    self.cache.driver().upsert(&stalled)?;
                    self.cache.discard(&stalled)?;
                    report.stalled_removed += 1;
                }
                Some(_) => {}
            },
            EntryState::Cached | EntryState::Queued => {
                if !path.is_file() {
                    debug!(
                        image_id = %entry.image_id,
                        state = %entry.state,
                        "index entry has no file, removing"
                    );
                    self.cache.driver().remove(entry.image_id)?;
                    report.invalid_removed += 1;
                }
            }
        }
        Ok(())
    }

    /// Removes files that match no entry. `indexed` is a snapshot of the
    /// index taken before the scan; a file it does not account for is checked
    /// against the live index before removal, since a writer may have
    /// recorded it after the snapshot.
    fn remove_orphans(
        &self,
        indexed: &HashMap<Uuid, EntryState>,
        report: &mut CleanReport,
    ) -> Result<()> {
        for file in self.cache.layout().scan()? {
            if let Some(&state) = indexed.get(&file.image_id) {
                if file_matches(state, file.state) {
                    continue;
                }
            }
            if let Some(entry) = self.cache.driver().get(file.image_id)? {
                if file_matches(entry.state, file.state) {
                    continue;
                }
            }
            // A writer may be between claiming its file and recording it.
            if file.state == EntryState::Caching {
                let age = SystemTime::now()
                    .duration_since(file.modified)
                    .unwrap_or_default();
                if age < self.cache.stall_time() {
                    continue;
                }
            }
            if remove_if_exists(&file.path)? {
                debug!(
                    image_id = %file.image_id,
                    path = %file.path.display(),
                    "removed file with no index entry"
                );
                report.orphans_removed += 1;
            }
        }
        Ok(())
    }
}

fn file_age(path: &std::path::Path) -> Option<std::time::Duration> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}
