//! Task records.
//!
//! Lifecycle columns live in `tasks`; the JSON payloads live in `task_info`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use super::Registry;
use crate::clock;
use crate::error::{Result, ServiceError};
use crate::tasks::Task;

const TASK_COLUMNS: &str = "SELECT t.id, t.type, t.status, i.input, i.result, i.message, \
     t.owner, t.expires_at, t.created_at, t.updated_at \
     FROM tasks t LEFT JOIN task_info i ON i.task_id = t.id";

type RawTask = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i64>,
    i64,
    i64,
);

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<RawTask> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn parse_json(raw: Option<String>, id: &str) -> Result<Option<Value>> {
    raw.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| ServiceError::Internal(format!("bad task payload on {id}: {e}")))
    })
    .transpose()
}

fn into_task(raw: RawTask) -> Result<Task> {
    let (id, task_type, status, input, result, message, owner, expires_at, created, updated) =
        raw;
    Ok(Task {
        id: Uuid::parse_str(&id)
            .map_err(|e| ServiceError::Internal(format!("bad task id '{id}': {e}")))?,
        task_type,
        status: status.parse()?,
        input: parse_json(input, &id)?.unwrap_or(Value::Null),
        result: parse_json(result, &id)?,
        message,
        owner,
        expires_at: expires_at.map(clock::from_millis),
        created_at: clock::from_millis(created),
        updated_at: clock::from_millis(updated),
    })
}

fn encode(value: &Value) -> Result<String> {
    serde_json::to_string(value).map_err(|e| ServiceError::Internal(e.to_string()))
}

fn write_info(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        "INSERT INTO task_info (task_id, input, result, message) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(task_id) DO UPDATE SET
             input = excluded.input,
             result = excluded.result,
             message = excluded.message",
        params![
            task.id.to_string(),
            encode(&task.input)?,
            task.result.as_ref().map(encode).transpose()?,
            task.message
        ],
    )?;
    Ok(())
}

// == Task Operations ==
impl Registry {
    pub fn create_task(&self, task: &Task) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO tasks (id, type, status, owner, expires_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                task.id.to_string(),
                task.task_type,
                task.status.as_str(),
                task.owner,
                task.expires_at.map(clock::to_millis),
                clock::to_millis(task.created_at),
                clock::to_millis(task.updated_at)
            ],
        )?;
        write_info(&tx, task)?;
        tx.commit()?;
        debug!(task_id = %task.id, task_type = %task.task_type, "task created");
        Ok(())
    }

    pub fn get_task(&self, id: Uuid) -> Result<Task> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("{TASK_COLUMNS} WHERE t.id = ?1 AND t.deleted = 0"),
                [id.to_string()],
                task_from_row,
            )
            .optional()?
            .ok_or_else(|| ServiceError::NotFound(format!("task {id}")))?;
        into_task(raw)
    }

    /// Live tasks that have not expired, newest first.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let now = clock::to_millis(clock::now());
        let mut stmt = conn.prepare(&format!(
            "{TASK_COLUMNS} WHERE t.deleted = 0 AND (t.expires_at IS NULL OR t.expires_at > ?1)
             ORDER BY t.created_at DESC, t.id"
        ))?;
        let raws = stmt
            .query_map([now], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(into_task).collect()
    }

    /// Persists the task's current state.
    pub fn save_task(&self, task: &Task) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE tasks SET status = ?1, expires_at = ?2, updated_at = ?3
             WHERE id = ?4 AND deleted = 0",
            params![
                task.status.as_str(),
                task.expires_at.map(clock::to_millis),
                clock::to_millis(task.updated_at),
                task.id.to_string()
            ],
        )?;
        if changed == 0 {
            return Err(ServiceError::NotFound(format!("task {}", task.id)));
        }
        write_info(&tx, task)?;
        tx.commit()?;
        Ok(())
    }

    /// Soft deletes tasks whose expiry has passed. Images they produced are
    /// not affected.
    pub fn expire_tasks(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let now = clock::to_millis(now);
        let expired = conn.execute(
            "UPDATE tasks SET deleted = 1, deleted_at = ?1
             WHERE deleted = 0 AND expires_at IS NOT NULL AND expires_at <= ?1",
            [now],
        )?;
        if expired > 0 {
            info!(expired, "expired tasks deleted");
        }
        Ok(expired)
    }
}
