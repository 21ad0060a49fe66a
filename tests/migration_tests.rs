//! Integration Tests for schema upgrades and purging
//!
//! Runs against registry files, with a second raw connection standing in
//! for rows written by an older release.

use chrono::Duration;
use rusqlite::{params, Connection};
use serde_json::json;
use tempfile::TempDir;

use image_service::clock;
use image_service::migration::{Migrator, SchemaVersion};
use image_service::registry::{Location, NewImage, Registry, Visibility};
use image_service::tasks::{Task, TaskStatus};

const LEGACY_IMAGE: &str = "6f1c4c8e-6b7e-4f0c-9d55-0b0f2b6b8a11";
const LEGACY_TASK: &str = "0d9b3c52-17a4-4bc6-8f35-3f1f1b0e7c42";

/// Schema and rows as left by the last single-version release.
fn write_legacy_database(path: &std::path::Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "
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
        CREATE TABLE migrate_version (version INTEGER NOT NULL);
        INSERT INTO migrate_version (version) VALUES (3);
        ",
    )
    .unwrap();

    let now = clock::to_millis(clock::now());
    conn.execute(
        "INSERT INTO images (id, name, status, is_public, created_at, updated_at)
         VALUES (?1, 'legacy', 'active', 1, ?2, ?2)",
        params![LEGACY_IMAGE, now],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO tasks (id, type, status, input, created_at, updated_at)
         VALUES (?1, 'import', 'pending', '{\"import_from\":\"file:///legacy\"}', ?2, ?2)",
        params![LEGACY_TASK, now],
    )
    .unwrap();
}

fn open_legacy() -> (TempDir, Registry) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.db");
    write_legacy_database(&path);
    let registry = Registry::open(&path).unwrap();
    (dir, registry)
}

#[test]
fn test_rolling_upgrade_from_legacy() {
    let (_dir, registry) = open_legacy();
    let migrator = Migrator::new(&registry);
    assert_eq!(migrator.version().unwrap(), SchemaVersion::Legacy { version: 3 });
    assert!(migrator.check_ready().is_err());

    migrator.expand().unwrap();
    assert_eq!(migrator.pending().unwrap(), 2);
    assert!(migrator.check_ready().is_err(), "nodes must wait for the data migration");

    assert_eq!(migrator.migrate().unwrap(), 2);
    migrator.check_ready().unwrap();
    assert!(!migrator.version().unwrap().is_latest());

    // New-release nodes run here while the contract is still pending.
    let legacy_id = LEGACY_IMAGE.parse().unwrap();
    assert_eq!(registry.get_image(legacy_id).unwrap().visibility, Visibility::Public);
    let task = registry.get_task(LEGACY_TASK.parse().unwrap()).unwrap();
    assert_eq!(task.input["import_from"], "file:///legacy");
    let fresh = registry
        .create_image(NewImage {
            name: Some("mid-upgrade".to_string()),
            visibility: Visibility::Private,
            ..NewImage::default()
        })
        .unwrap();

    let version = migrator.contract().unwrap();
    assert!(version.is_latest());
    assert_eq!(registry.get_image(fresh.id).unwrap().visibility, Visibility::Private);
    assert_eq!(registry.get_image(legacy_id).unwrap().name.as_deref(), Some("legacy"));
    let task = registry.get_task(LEGACY_TASK.parse().unwrap()).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.input["import_from"], "file:///legacy");
}

#[test]
fn test_contract_refused_before_migrate() {
    let (_dir, registry) = open_legacy();
    let migrator = Migrator::new(&registry);
    migrator.expand().unwrap();

    assert!(migrator.contract().is_err());
    assert!(!migrator.version().unwrap().is_latest());
}

#[test]
fn test_sync_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.db");
    {
        let registry = Registry::open(&path).unwrap();
        Migrator::new(&registry).sync().unwrap();
    }

    let registry = Registry::open(&path).unwrap();
    let migrator = Migrator::new(&registry);
    assert_eq!(migrator.version().unwrap(), SchemaVersion::latest());
    migrator.check_ready().unwrap();
}

// == Purge ==

fn backdate(path: &std::path::Path, days: i64) {
    let cutoff = clock::to_millis(clock::now() - Duration::days(days));
    let conn = Connection::open(path).unwrap();
    for table in ["images", "image_locations", "tasks"] {
        conn.execute(
            &format!("UPDATE {table} SET deleted_at = ?1 WHERE deleted = 1"),
            [cutoff],
        )
        .unwrap();
    }
}

#[test]
fn test_purge_removes_old_soft_deleted_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.db");
    let registry = Registry::open(&path).unwrap();
    Migrator::new(&registry).sync().unwrap();

    let image = registry.create_image(NewImage::default()).unwrap();
    registry
        .add_location(
            image.id,
            &Location {
                store: "fast".to_string(),
                key: image.id.to_string(),
            },
        )
        .unwrap();
    registry.delete_image(image.id).unwrap();

    let mut task = Task::new("import", json!({"import_from": "file:///x"}), None);
    registry.create_task(&task).unwrap();
    task.begin().unwrap();
    task.succeed(json!({"image_id": image.id}), Duration::zero()).unwrap();
    registry.save_task(&task).unwrap();
    assert_eq!(registry.expire_tasks(clock::now()).unwrap(), 1);

    // Too recent to purge.
    assert_eq!(registry.purge(30, None).unwrap().total(), 0);

    backdate(&path, 45);
    // The image row is still referenced by its location.
    assert_eq!(registry.purge_images_table(30, None).unwrap().images, 0);

    let report = registry.purge(30, None).unwrap();
    assert_eq!(report.image_locations, 1);
    assert_eq!(report.tasks, 1);
    assert_eq!(report.task_info, 1);

    assert_eq!(registry.purge_images_table(30, None).unwrap().images, 1);
    assert_eq!(registry.purge(30, None).unwrap().total(), 0);
}

#[test]
fn test_purge_honours_max_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.db");
    let registry = Registry::open(&path).unwrap();
    Migrator::new(&registry).sync().unwrap();

    for _ in 0..3 {
        let image = registry.create_image(NewImage::default()).unwrap();
        registry.delete_image(image.id).unwrap();
    }
    backdate(&path, 10);

    assert_eq!(registry.purge_images_table(5, Some(2)).unwrap().images, 2);
    assert_eq!(registry.purge_images_table(5, Some(2)).unwrap().images, 1);
    assert!(registry.purge_images_table(5, Some(0)).is_err());
}
