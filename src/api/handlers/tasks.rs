//! Task endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use futures::FutureExt;
use tracing::info;
use uuid::Uuid;

use super::AppState;
use crate::error::{Result, ServiceError};
use crate::models::{CreateTaskRequest, TaskListResponse};
use crate::tasks::{Task, UriImport, TASK_TYPE_IMPORT};

/// Handler for POST /v2/tasks
///
/// Only `import` tasks can be created directly; image imports through the
/// import call create their own tasks.
pub async fn create_task_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>)> {
    if req.task_type != TASK_TYPE_IMPORT {
        return Err(ServiceError::InvalidRequest(format!(
            "task type '{}' cannot be created, expected '{TASK_TYPE_IMPORT}'",
            req.task_type
        )));
    }
    let import = UriImport::from_input(&req.input)?;

    let mut task = Task::new(TASK_TYPE_IMPORT, req.input, None);
    state.registry.create_task(&task)?;

    let importer = state.importer.clone();
    if let Err(e) = state.executor.submit(
        task.clone(),
        async move { importer.import_from_uri(import).await }.boxed(),
    ) {
        task.fail(e.to_string(), state.task_ttl())?;
        state.registry.save_task(&task)?;
        return Err(e);
    }

    info!(task_id = %task.id, "import task created");
    Ok((StatusCode::CREATED, Json(task)))
}

/// Handler for GET /v2/tasks
pub async fn list_tasks_handler(State(state): State<AppState>) -> Result<Json<TaskListResponse>> {
    let tasks = state.registry.list_tasks()?;
    Ok(Json(TaskListResponse { tasks }))
}

/// Handler for GET /v2/tasks/:id
pub async fn get_task_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>> {
    Ok(Json(state.registry.get_task(id)?))
}
