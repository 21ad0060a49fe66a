//! Task entity and its state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock;
use crate::error::{Result, ServiceError};

/// Task created by `POST /v2/images/{id}/import`.
pub const TASK_TYPE_API_IMAGE_IMPORT: &str = "api_image_import";
/// Task created through `POST /v2/tasks`, importing from a URI.
pub const TASK_TYPE_IMPORT: &str = "import";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "success" => Ok(TaskStatus::Success),
            "failure" => Ok(TaskStatus::Failure),
            other => Err(ServiceError::InvalidRequest(format!(
                "unknown task status '{other}'"
            ))),
        }
    }
}

/// An asynchronous unit of work.
///
/// Fields only change through the transition methods, which keep `result`
/// set only in `success`, `message` set only in `failure`, and `expires_at`
/// set once a terminal state is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    pub input: Value,
    pub result: Option<Value>,
    pub message: Option<String>,
    pub owner: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_type: &str, input: Value, owner: Option<String>) -> Self {
        let now = clock::now();
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.to_string(),
            status: TaskStatus::Pending,
            input,
            result: None,
            message: None,
            owner,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `pending -> processing`
    pub fn begin(&mut self) -> Result<()> {
        self.transition(TaskStatus::Processing)?;
        Ok(())
    }

    /// `processing -> success`
    pub fn succeed(&mut self, result: Value, ttl: Duration) -> Result<()> {
        self.transition(TaskStatus::Success)?;
        self.result = Some(result);
        self.expires_at = Some(self.updated_at + ttl);
        Ok(())
    }

    /// `processing -> failure`, or `pending -> failure` for a task that could
    /// not be started.
    pub fn fail(&mut self, message: impl Into<String>, ttl: Duration) -> Result<()> {
        self.transition(TaskStatus::Failure)?;
        self.message = Some(message.into());
        self.expires_at = Some(self.updated_at + ttl);
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn transition(&mut self, to: TaskStatus) -> Result<()> {
        let allowed = matches!(
            (self.status, to),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Pending, TaskStatus::Failure)
                | (TaskStatus::Processing, TaskStatus::Success)
                | (TaskStatus::Processing, TaskStatus::Failure)
        );
        if !allowed {
            return Err(ServiceError::Conflict(format!(
                "task {} cannot move from {} to {}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        self.updated_at = clock::now();
        Ok(())
    }
}
