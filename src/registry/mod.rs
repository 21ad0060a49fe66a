//! Registry Module
//!
//! Image and task records in the shared registry database. Every service
//! node and every operator utility opens the same SQLite file; the schema is
//! managed by [`crate::migration`].

mod images;
mod purge;
mod tasks;

pub use images::{
    validate_user_properties, Image, ImageStatus, Location, NewImage, Visibility,
    FAILED_IMPORT_PROPERTY, IMPORTING_TO_STORES_PROPERTY, RESERVED_PREFIX,
};
pub use purge::PurgeReport;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::debug;

use crate::error::{Result, ServiceError};

/// Handle to the registry database.
#[derive(Debug)]
pub struct Registry {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Registry {
    /// Opens (or creates) the database file. The schema is not touched; run
    /// the migration coordinator before use.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=30000;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        debug!(path = %path.display(), "registry database opened");

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ServiceError::Internal("registry connection lock poisoned".to_string()))
    }
}

/// Whether `table` exists in the database.
pub(crate) fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
