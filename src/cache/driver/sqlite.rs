//! SQLite cache index.
//!
//! One row per entry in `cache_entries`, stored in a database file inside the
//! cache directory. WAL mode plus a busy timeout lets the server, the pruner
//! and the cleaner share the file from separate processes.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::CacheDriver;
use crate::cache::{CacheEntry, EntryState};
use crate::clock;
use crate::error::{Result, ServiceError};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS cache_entries (
    image_id TEXT PRIMARY KEY,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    last_accessed_at INTEGER NOT NULL,
    hit_count INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_entries_state ON cache_entries(state);
CREATE INDEX IF NOT EXISTS idx_cache_entries_accessed ON cache_entries(last_accessed_at);
";

const SELECT_COLUMNS: &str =
    "SELECT image_id, size_bytes, created_at, last_accessed_at, hit_count, state FROM cache_entries";

/// Cache index kept in an embedded SQLite database.
#[derive(Debug)]
pub struct SqliteDriver {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteDriver {
    /// Opens (or creates) the index database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=30000;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ServiceError::Internal("cache index lock poisoned".to_string()))
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<(String, i64, i64, i64, i64, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode(raw: (String, i64, i64, i64, i64, String)) -> Result<CacheEntry> {
    let (image_id, size, created, accessed, hits, state) = raw;
    Ok(CacheEntry {
        image_id: Uuid::parse_str(&image_id)
            .map_err(|e| ServiceError::Internal(format!("bad image id '{image_id}' in index: {e}")))?,
        size_bytes: size.max(0) as u64,
        created_at: clock::from_millis(created),
        last_accessed_at: clock::from_millis(accessed),
        hit_count: hits.max(0) as u64,
        state: state.parse()?,
    })
}

impl CacheDriver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn get(&self, image_id: Uuid) -> Result<Option<CacheEntry>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE image_id = ?1"),
                params![image_id.to_string()],
                entry_from_row,
            )
            .optional()?;
        raw.map(decode).transpose()
    }

    fn list(&self, state: Option<EntryState>) -> Result<Vec<CacheEntry>> {
        let conn = self.conn()?;
        let rows = match state {
            Some(state) => {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_COLUMNS} WHERE state = ?1 ORDER BY last_accessed_at"
                ))?;
                let rows = stmt
                    .query_map(params![state.as_str()], entry_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY last_accessed_at"))?;
                let rows = stmt
                    .query_map([], entry_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        rows.into_iter().map(decode).collect()
    }

    fn upsert(&self, entry: &CacheEntry) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cache_entries
                (image_id, size_bytes, created_at, last_accessed_at, hit_count, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(image_id) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                created_at = excluded.created_at,
                last_accessed_at = excluded.last_accessed_at,
                hit_count = excluded.hit_count,
                state = excluded.state",
            params![
                entry.image_id.to_string(),
                entry.size_bytes as i64,
                clock::to_millis(entry.created_at),
                clock::to_millis(entry.last_accessed_at),
                entry.hit_count as i64,
                entry.state.as_str(),
            ],
        )?;
        Ok(())
    }

    fn touch(&self, image_id: Uuid) -> Result<Option<CacheEntry>> {
        {
            let conn = self.conn()?;
            let updated = conn.execute(
                "UPDATE cache_entries
                 SET hit_count = hit_count + 1, last_accessed_at = ?2
                 WHERE image_id = ?1",
                params![image_id.to_string(), clock::to_millis(clock::now())],
            )?;
            if updated == 0 {
                return Ok(None);
            }
        }
        self.get(image_id)
    }

    fn remove(&self, image_id: Uuid) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM cache_entries WHERE image_id = ?1",
            params![image_id.to_string()],
        )?;
        Ok(removed > 0)
    }
}
