//! Purging of soft-deleted rows.
//!
//! `purge` covers the child tables only. Image rows are purged separately
//! (`purge_images_table`) and only once nothing references them.

use chrono::Duration;
use rusqlite::params;
use serde::Serialize;
use tracing::info;

use super::Registry;
use crate::clock;
use crate::error::{Result, ServiceError};

/// Rows deleted by one purge, per table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub image_locations: usize,
    pub tasks: usize,
    pub task_info: usize,
    pub images: usize,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.image_locations + self.tasks + self.task_info + self.images
    }
}

fn validate_max_rows(max_rows: Option<u64>) -> Result<i64> {
    match max_rows {
        Some(0) => Err(ServiceError::InvalidRequest(
            "max_rows must be a positive number or -1 for no limit".to_string(),
        )),
        Some(n) => Ok(i64::try_from(n).unwrap_or(i64::MAX)),
        // SQLite treats a negative LIMIT as unlimited.
        None => Ok(-1),
    }
}

fn cutoff_millis(age_in_days: u32) -> i64 {
    clock::to_millis(clock::now() - Duration::days(i64::from(age_in_days)))
}

impl Registry {
    /// Deletes soft-deleted `image_locations` and `tasks` rows (with their
    /// `task_info`) older than `age_in_days`, at most `max_rows` rows in total.
    pub fn purge(&self, age_in_days: u32, max_rows: Option<u64>) -> Result<PurgeReport> {
        let limit = validate_max_rows(max_rows)?;
        let cutoff = cutoff_millis(age_in_days);
        let mut report = PurgeReport::default();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        report.image_locations = tx.execute(
            "DELETE FROM image_locations WHERE id IN (
                 SELECT id FROM image_locations
                 WHERE deleted = 1 AND deleted_at < ?1
                 ORDER BY deleted_at, id LIMIT ?2)",
            params![cutoff, limit],
        )?;

        let mut remaining = if limit < 0 {
            u64::MAX
        } else {
            (limit as u64).saturating_sub(report.image_locations as u64)
        };

        if remaining > 0 {
            // Each task costs one row plus one for its info row, if any.
            let candidates: Vec<(String, u64)> = {
                let mut stmt = tx.prepare(
                    "SELECT t.id, (SELECT COUNT(*) FROM task_info i WHERE i.task_id = t.id)
                     FROM tasks t
                     WHERE t.deleted = 1 AND t.deleted_at < ?1
                     ORDER BY t.deleted_at, t.id",
                )?;
                let rows = stmt.query_map([cutoff], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            for (id, info_rows) in candidates {
                let cost = 1 + info_rows;
                if cost > remaining {
                    break;
                }
                report.task_info +=
                    tx.execute("DELETE FROM task_info WHERE task_id = ?1", [&id])?;
                report.tasks += tx.execute("DELETE FROM tasks WHERE id = ?1", [&id])?;
                remaining -= cost;
            }
        }

        tx.commit()?;
        info!(
            age_in_days,
            image_locations = report.image_locations,
            tasks = report.tasks,
            task_info = report.task_info,
            "purged soft-deleted rows"
        );
        Ok(report)
    }

    /// Deletes soft-deleted `images` rows older than `age_in_days` that no
    /// location row references any more.
    pub fn purge_images_table(
        &self,
        age_in_days: u32,
        max_rows: Option<u64>,
    ) -> Result<PurgeReport> {
        let limit = validate_max_rows(max_rows)?;
        let cutoff = cutoff_millis(age_in_days);

        let conn = self.conn()?;
        let images = conn.execute(
            "DELETE FROM images WHERE id IN (
                 SELECT i.id FROM images i
                 WHERE i.deleted = 1 AND i.deleted_at < ?1
                   AND NOT EXISTS (SELECT 1 FROM image_locations l WHERE l.image_id = i.id)
                 ORDER BY i.deleted_at, i.id LIMIT ?2)",
            params![cutoff, limit],
        )?;

        info!(age_in_days, images, "purged soft-deleted images");
        Ok(PurgeReport {
            images,
            ..PurgeReport::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::migrated_registry;
    use crate::registry::{Location, NewImage};
    use crate::tasks::Task;
    use serde_json::json;
    use uuid::Uuid;

    /// Image with one location, soft deleted `days` ago.
    fn deleted_image(registry: &Registry, days: i64) -> Uuid {
        let id = registry.create_image(NewImage::default()).unwrap().id;
        registry
            .add_location(
                id,
                &Location {
                    store: "fast".to_string(),
                    key: id.to_string(),
                },
            )
            .unwrap();
        registry.delete_image(id).unwrap();
        backdate(registry, "images", "id", &id.to_string(), days);
        backdate(registry, "image_locations", "image_id", &id.to_string(), days);
        id
    }

    fn deleted_task(registry: &Registry, days: i64) -> Uuid {
        let task = Task::new("import", json!({}), None);
        registry.create_task(&task).unwrap();
        let conn = registry.conn().unwrap();
        conn.execute(
            "UPDATE tasks SET deleted = 1 WHERE id = ?1",
            [task.id.to_string()],
        )
        .unwrap();
        drop(conn);
        backdate(registry, "tasks", "id", &task.id.to_string(), days);
        task.id
    }

    fn backdate(registry: &Registry, table: &str, key: &str, value: &str, days: i64) {
        let at = clock::to_millis(clock::now() - Duration::days(days));
        registry
            .conn()
            .unwrap()
            .execute(
                &format!("UPDATE {table} SET deleted_at = ?1 WHERE {key} = ?2"),
                params![at, value],
            )
            .unwrap();
    }

    fn count(registry: &Registry, table: &str) -> i64 {
        registry
            .conn()
            .unwrap()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_zero_max_rows_is_rejected() {
        let registry = migrated_registry();
        assert!(matches!(
            registry.purge(30, Some(0)),
            Err(ServiceError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_purge_respects_age_and_never_touches_images() {
        let registry = migrated_registry();
        deleted_image(&registry, 40);
        deleted_image(&registry, 5);
        let old_task = deleted_task(&registry, 40);
        deleted_task(&registry, 5);

        let report = registry.purge(30, None).unwrap();

        assert_eq!(report.image_locations, 1);
        assert_eq!(report.tasks, 1);
        assert_eq!(report.task_info, 1);
        assert_eq!(report.images, 0);
        assert_eq!(count(&registry, "images"), 2);
        assert!(registry.get_task(old_task).is_err());
    }

    #[test]
    fn test_purge_stops_at_max_rows() {
        let registry = migrated_registry();
        for _ in 0..3 {
            deleted_image(&registry, 40);
        }
        for _ in 0..3 {
            deleted_task(&registry, 40);
        }

        let report = registry.purge(30, Some(4)).unwrap();

        // Three locations, then one task would need two rows.
        assert_eq!(report.image_locations, 3);
        assert_eq!(report.tasks, 0);
        assert!(report.total() <= 4);

        let report = registry.purge(30, Some(4)).unwrap();
        assert_eq!(report.tasks, 2);
        assert_eq!(report.total(), 4);
    }

    #[test]
    fn test_purge_images_table_skips_referenced_rows() {
        let registry = migrated_registry();
        let id = deleted_image(&registry, 40);

        let report = registry.purge_images_table(30, None).unwrap();
        assert_eq!(report.images, 0);

        registry.purge(30, None).unwrap();
        let report = registry.purge_images_table(30, None).unwrap();
        assert_eq!(report.images, 1);
        assert!(registry.get_image(id).is_err());
        assert_eq!(count(&registry, "images"), 0);
    }
}
