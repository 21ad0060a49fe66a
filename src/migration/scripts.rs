//! Registry schema history.
//!
//! Each release after the base carries an expand script (additive only, safe
//! while older nodes are still serving), an optional data migration, and a
//! contract script that drops what the previous release needed. Triggers
//! installed by an expand script keep old and new structures in step until
//! the matching contract removes them.

use rusqlite::Connection;

use crate::error::Result;

/// Last version written by releases that tracked a single number.
pub const LEGACY_FINAL_VERSION: i64 = 3;

/// Backfill run between expand and contract.
pub struct DataMigration {
    pub name: &'static str,
    /// Rows still waiting to be migrated.
    pub pending: fn(&Connection) -> Result<u64>,
    /// Migrates all pending rows, returning how many were touched.
    pub run: fn(&Connection) -> Result<u64>,
}

pub struct Release {
    pub name: &'static str,
    pub expand: &'static str,
    pub contract: &'static str,
    pub expand_sql: &'static str,
    pub contract_sql: &'static str,
    pub data: Option<DataMigration>,
}

/// Releases in order. The first entry is the base schema; its expand and
/// contract revisions are the same.
pub const RELEASES: &[Release] = &[
    Release {
        name: "1.0",
        expand: "1_0_base",
        contract: "1_0_base",
        expand_sql: BASE_SQL,
        contract_sql: "",
        data: None,
    },
    Release {
        name: "1.1",
        expand: "1_1_expand01",
        contract: "1_1_contract01",
        expand_sql: EXPAND_1_1,
        contract_sql: CONTRACT_1_1,
        data: Some(DataMigration {
            name: "image visibility backfill",
            pending: visibility_pending,
            run: visibility_run,
        }),
    },
    Release {
        name: "1.2",
        expand: "1_2_expand01",
        contract: "1_2_contract01",
        expand_sql: EXPAND_1_2,
        contract_sql: CONTRACT_1_2,
        data: Some(DataMigration {
            name: "task info copy",
            pending: task_info_pending,
            run: task_info_run,
        }),
    },
];

pub fn latest() -> &'static Release {
    &RELEASES[RELEASES.len() - 1]
}

pub fn expand_index(revision: &str) -> Option<usize> {
    RELEASES.iter().position(|r| r.expand == revision)
}

pub fn contract_index(revision: &str) -> Option<usize> {
    RELEASES.iter().position(|r| r.contract == revision)
}

// == Base ==
/// Schema as left by the last single-version release.
pub const BASE_SQL: &str = "
CREATE TABLE images (
    id TEXT PRIMARY KEY,
    name TEXT,
    status TEXT NOT NULL,
    is_public INTEGER NOT NULL DEFAULT 0,
    size INTEGER,
    properties TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at INTEGER
);
CREATE INDEX ix_images_deleted ON images (deleted);

CREATE TABLE image_locations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id TEXT NOT NULL REFERENCES images (id),
    store TEXT NOT NULL,
    key TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at INTEGER
);
CREATE INDEX ix_image_locations_image_id ON image_locations (image_id);
CREATE INDEX ix_image_locations_deleted ON image_locations (deleted);

CREATE TABLE tasks (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    status TEXT NOT NULL,
    input TEXT,
    result TEXT,
    message TEXT,
    owner TEXT,
    expires_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at INTEGER
);
CREATE INDEX ix_tasks_deleted ON tasks (deleted);
";

// == 1.1: is_public -> visibility ==
const EXPAND_1_1: &str = "
ALTER TABLE images ADD COLUMN visibility TEXT;
CREATE INDEX ix_images_visibility ON images (visibility);

CREATE TRIGGER images_visibility_on_insert AFTER INSERT ON images
BEGIN
    UPDATE images SET visibility = CASE NEW.is_public WHEN 1 THEN 'public' ELSE 'shared' END
        WHERE id = NEW.id AND NEW.visibility IS NULL;
    UPDATE images SET is_public = CASE NEW.visibility WHEN 'public' THEN 1 ELSE 0 END
        WHERE id = NEW.id AND NEW.visibility IS NOT NULL;
END;

CREATE TRIGGER images_visibility_on_update AFTER UPDATE OF visibility ON images
WHEN NEW.visibility IS NOT NULL AND NEW.is_public IS NOT (NEW.visibility = 'public')
BEGIN
    UPDATE images SET is_public = (NEW.visibility = 'public') WHERE id = NEW.id;
END;

CREATE TRIGGER images_is_public_on_update AFTER UPDATE OF is_public ON images
WHEN NEW.is_public IS NOT (COALESCE(NEW.visibility, '') = 'public')
BEGIN
    UPDATE images SET visibility = CASE NEW.is_public WHEN 1 THEN 'public' ELSE 'shared' END
        WHERE id = NEW.id;
END;
";

const CONTRACT_1_1: &str = "
DROP TRIGGER IF EXISTS images_visibility_on_insert;
DROP TRIGGER IF EXISTS images_visibility_on_update;
DROP TRIGGER IF EXISTS images_is_public_on_update;
ALTER TABLE images DROP COLUMN is_public;
";

fn visibility_pending(conn: &Connection) -> Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM images WHERE visibility IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

fn visibility_run(conn: &Connection) -> Result<u64> {
    let n = conn.execute(
        "UPDATE images
         SET visibility = CASE is_public WHEN 1 THEN 'public' ELSE 'shared' END
         WHERE visibility IS NULL",
        [],
    )?;
    Ok(n as u64)
}

// == 1.2: task payloads -> task_info ==
const EXPAND_1_2: &str = "
CREATE TABLE task_info (
    task_id TEXT PRIMARY KEY REFERENCES tasks (id),
    input TEXT,
    result TEXT,
    message TEXT
);

CREATE TRIGGER tasks_info_on_insert AFTER INSERT ON tasks
WHEN NEW.input IS NOT NULL OR NEW.result IS NOT NULL OR NEW.message IS NOT NULL
BEGIN
    INSERT OR REPLACE INTO task_info (task_id, input, result, message)
    VALUES (NEW.id, NEW.input, NEW.result, NEW.message);
END;

CREATE TRIGGER tasks_info_on_update AFTER UPDATE OF input, result, message ON tasks
WHEN NOT EXISTS (
    SELECT 1 FROM task_info
    WHERE task_id = NEW.id
      AND input IS NEW.input AND result IS NEW.result AND message IS NEW.message
)
BEGIN
    INSERT OR REPLACE INTO task_info (task_id, input, result, message)
    VALUES (NEW.id, NEW.input, NEW.result, NEW.message);
END;

CREATE TRIGGER task_info_to_tasks_on_insert AFTER INSERT ON task_info
BEGIN
    UPDATE tasks SET input = NEW.input, result = NEW.result, message = NEW.message
    WHERE id = NEW.task_id
      AND (input IS NOT NEW.input OR result IS NOT NEW.result OR message IS NOT NEW.message);
END;

CREATE TRIGGER task_info_to_tasks_on_update AFTER UPDATE ON task_info
BEGIN
    UPDATE tasks SET input = NEW.input, result = NEW.result, message = NEW.message
    WHERE id = NEW.task_id
      AND (input IS NOT NEW.input OR result IS NOT NEW.result OR message IS NOT NEW.message);
END;
";

const CONTRACT_1_2: &str = "
DROP TRIGGER IF EXISTS tasks_info_on_insert;
DROP TRIGGER IF EXISTS tasks_info_on_update;
DROP TRIGGER IF EXISTS task_info_to_tasks_on_insert;
DROP TRIGGER IF EXISTS task_info_to_tasks_on_update;
ALTER TABLE tasks DROP COLUMN input;
ALTER TABLE tasks DROP COLUMN result;
ALTER TABLE tasks DROP COLUMN message;
";

fn task_info_pending(conn: &Connection) -> Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks t
         WHERE NOT EXISTS (SELECT 1 FROM task_info i WHERE i.task_id = t.id)",
        [],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

fn task_info_run(conn: &Connection) -> Result<u64> {
    let n = conn.execute(
        "INSERT INTO task_info (task_id, input, result, message)
         SELECT t.id, t.input, t.result, t.message FROM tasks t
         WHERE NOT EXISTS (SELECT 1 FROM task_info i WHERE i.task_id = t.id)",
        [],
    )?;
    Ok(n as u64)
}
