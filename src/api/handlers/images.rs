//! Image endpoints: records, data upload and download, staging and import.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::FutureExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{with_cache, AppState};
use crate::error::{Result, ServiceError};
use crate::models::{CreateImageRequest, ImageListResponse, ImportImageRequest};
use crate::registry::{Image, ImageStatus, Location};
use crate::tasks::{Task, TASK_TYPE_API_IMAGE_IMPORT};

fn check_size(state: &AppState, len: usize) -> Result<()> {
    if len as u64 > state.config.image_size_cap {
        return Err(ServiceError::InvalidRequest(format!(
            "image of {len} bytes exceeds the size cap of {} bytes",
            state.config.image_size_cap
        )));
    }
    Ok(())
}

/// Handler for POST /v2/images
pub async fn create_image_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateImageRequest>,
) -> Result<(StatusCode, Json<Image>)> {
    if let Some(error_msg) = req.validate() {
        return Err(ServiceError::InvalidRequest(error_msg));
    }
    let image = state.registry.create_image(req.into())?;
    Ok((StatusCode::CREATED, Json(image)))
}

/// Handler for GET /v2/images
pub async fn list_images_handler(State(state): State<AppState>) -> Result<Json<ImageListResponse>> {
    let images = state.registry.list_images()?;
    Ok(Json(ImageListResponse { images }))
}

/// Handler for GET /v2/images/:id
pub async fn get_image_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Image>> {
    Ok(Json(state.registry.get_image(id)?))
}

/// Handler for DELETE /v2/images/:id
///
/// Soft deletes the record, then removes the image data from every store,
/// the staging area and the local cache. Data removal failures are logged;
/// the record stays deleted.
pub async fn delete_image_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    let image = state.registry.get_image(id)?;
    state.registry.delete_image(id)?;

    for location in &image.locations {
        let removed = match state.stores.get(&location.store) {
            Ok(store) => store.delete(&location.key).await,
            Err(e) => Err(e),
        };
        if let Err(e) = removed {
            warn!(image_id = %id, store = %location.store, error = %e, "failed to delete image data");
        }
    }
    if let Err(e) = state.importer.staging().remove(id).await {
        warn!(image_id = %id, error = %e, "failed to remove staged data");
    }
    if let Err(e) = with_cache(&state.cache, move |cache| cache.purge_image(id)).await {
        warn!(image_id = %id, error = %e, "failed to purge cached image");
    }

    info!(image_id = %id, "image deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for PUT /v2/images/:id/file
///
/// Direct upload into the default store. The image must be `queued`; it is
/// `saving` during the write and `active` afterwards. A failed write puts it
/// back to `queued`.
pub async fn upload_image_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<StatusCode> {
    check_size(&state, body.len())?;
    let image = state.registry.get_image(id)?;
    if image.status != ImageStatus::Queued {
        return Err(ServiceError::Conflict(format!(
            "image {id} is {}, data can only be uploaded to a queued image",
            image.status
        )));
    }
    state.registry.update_status(id, ImageStatus::Saving)?;

    let store = state.stores.default_store();
    let key = id.to_string();
    let stored = async {
        let size = store.put(&key, &body).await?;
        state.registry.add_location(
            id,
            &Location {
                store: store.name().to_string(),
                key: key.clone(),
            },
        )?;
        state.registry.set_size(id, size)?;
        state.registry.update_status(id, ImageStatus::Active)
    }
    .await;

    match stored {
        Ok(_) => {
            info!(image_id = %id, bytes = body.len(), store = store.name(), "image uploaded");
            Ok(StatusCode::NO_CONTENT)
        }
        Err(e) => {
            if let Err(reset) = state.registry.update_status(id, ImageStatus::Queued) {
                warn!(image_id = %id, error = %reset, "failed to reset image status");
            }
            Err(e)
        }
    }
}

/// Handler for GET /v2/images/:id/file
///
/// Serves from the local cache when possible. On a miss, or when the cache
/// cannot be read, the data is read from the image's first location and
/// written to the cache before the response is returned; a failed cache
/// write only costs the next reader a miss.
pub async fn download_image_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response> {
    let image = state.registry.get_image(id)?;
    if image.status != ImageStatus::Active {
        return Err(ServiceError::Conflict(format!(
            "image {id} is {}, no data to download",
            image.status
        )));
    }

    let cached = match with_cache(&state.cache, move |cache| cache.read(id)).await {
        Ok(cached) => cached,
        Err(e) => {
            warn!(image_id = %id, error = %e, "cache read failed, serving from store");
            None
        }
    };
    let data = match cached {
        Some(data) => data,
        None => {
            let location = image
                .locations
                .first()
                .ok_or_else(|| ServiceError::Conflict(format!("image {id} has no locations")))?;
            let data = state
                .stores
                .get(&location.store)?
                .get(&location.key)
                .await?;

            let copy = data.clone();
            match with_cache(&state.cache, move |cache| cache.write(id, &copy)).await {
                Ok(written) => debug!(image_id = %id, written, "cache fill after miss"),
                Err(e) => warn!(image_id = %id, error = %e, "failed to cache image"),
            }
            data
        }
    };

    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data).into_response())
}

/// Handler for PUT /v2/images/:id/stage
///
/// Stages data for a later `glance-direct` import; the image moves to
/// `uploading`.
pub async fn stage_image_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<StatusCode> {
    check_size(&state, body.len())?;
    let image = state.registry.get_image(id)?;
    if image.status != ImageStatus::Queued {
        return Err(ServiceError::Conflict(format!(
            "image {id} is {}, only queued images can be staged",
            image.status
        )));
    }

    state.importer.staging().stage(id, &body).await?;
    state.registry.update_status(id, ImageStatus::Uploading)?;
    info!(image_id = %id, bytes = body.len(), "image staged");
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for POST /v2/images/:id/import
///
/// Validates the request, records an `api_image_import` task, marks the
/// import on the image and hands the work to the executor. Returns the task
/// as created.
pub async fn import_image_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ImportImageRequest>,
) -> Result<(StatusCode, Json<Task>)> {
    let request = state
        .importer
        .prepare(id, &req.method.name, req.stores, req.all_stores_must_succeed)
        .await?;

    let input = serde_json::to_value(&request)
        .map_err(|e| ServiceError::Internal(format!("cannot encode import request: {e}")))?;
    let mut task = Task::new(TASK_TYPE_API_IMAGE_IMPORT, input, None);
    state.registry.create_task(&task)?;

    if let Err(e) = state.importer.begin(&request) {
        task.fail(e.to_string(), state.task_ttl())?;
        state.registry.save_task(&task)?;
        return Err(e);
    }

    let importer = state.importer.clone();
    let job_request = request.clone();
    if let Err(e) = state
        .executor
        .submit(task.clone(), async move { importer.run(job_request).await }.boxed())
    {
        state
            .importer
            .abandon(&request, &mut task, &e.to_string(), state.task_ttl())?;
        return Err(e);
    }

    info!(image_id = %id, task_id = %task.id, method = %req.method.name, "image import accepted");
    Ok((StatusCode::ACCEPTED, Json(task)))
}
