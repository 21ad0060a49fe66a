//! Node-local maintenance lock.
//!
//! The pruner and the cleaner both rewrite the index and delete files. They
//! may be started by cron while a previous run is still going, so each run
//! holds `<cache_dir>/.maintenance.lock` for its duration.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::error::{Result, ServiceError};

const LOCK_FILE: &str = ".maintenance.lock";

/// Exclusive maintenance lock, released on drop.
#[derive(Debug)]
pub struct MaintenanceLock {
    path: PathBuf,
}

impl MaintenanceLock {
    /// Takes the lock for `holder`.
    ///
    /// A lock file older than `stale_after` is assumed to belong to a crashed
    /// run and is replaced. Otherwise fails with `Conflict`.
    pub fn acquire(dir: &Path, holder: &str, stale_after: Duration) -> Result<Self> {
        let path = dir.join(LOCK_FILE);

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{holder} pid={}", std::process::id())?;
                    debug!(holder, path = %path.display(), "maintenance lock acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if !is_stale(&path, stale_after) {
                        break;
                    }
                    warn!(path = %path.display(), "removing stale maintenance lock");
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        let owner = fs::read_to_string(&path).unwrap_or_default();
        Err(ServiceError::Conflict(format!(
            "cache maintenance already running ({})",
            owner.trim()
        )))
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > stale_after)
}

impl Drop for MaintenanceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release maintenance lock");
        }
    }
}
