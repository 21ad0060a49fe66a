//! Image Import
//!
//! Interoperable import: image data already staged on this node
//! (`glance-direct`), or already held by another store (`copy-image`), is
//! written to each target store in turn. Progress is published on the image
//! through the `os_glance_importing_to_stores` and `os_glance_failed_import`
//! properties.
//!
//! Also runs the `import` task type, which creates an image from a URI.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{StagingArea, StoreRegistry};
use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::registry::{
    validate_user_properties, Image, ImageStatus, Location, NewImage, Registry, Visibility,
    FAILED_IMPORT_PROPERTY, IMPORTING_TO_STORES_PROPERTY,
};
use crate::tasks::{Task, TASK_TYPE_API_IMAGE_IMPORT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportMethod {
    GlanceDirect,
    CopyImage,
}

impl ImportMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportMethod::GlanceDirect => "glance-direct",
            ImportMethod::CopyImage => "copy-image",
        }
    }
}

impl fmt::Display for ImportMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportMethod {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "glance-direct" => Ok(ImportMethod::GlanceDirect),
            "copy-image" => Ok(ImportMethod::CopyImage),
            other => Err(ServiceError::InvalidRequest(format!(
                "unknown import method '{other}'"
            ))),
        }
    }
}

/// A validated import, as recorded in the task input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRequest {
    pub image_id: Uuid,
    pub method: ImportMethod,
    /// Target stores, in processing order
    pub stores: Vec<String>,
    pub all_stores_must_succeed: bool,
}

/// Input of an `import` task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UriImport {
    /// `file://` path or `http(s)://` URL
    pub import_from: String,
    #[serde(default)]
    pub import_from_format: Option<String>,
    #[serde(default)]
    pub image_properties: BTreeMap<String, String>,
}

impl UriImport {
    /// Parses and checks task input supplied by a user.
    pub fn from_input(input: &Value) -> Result<Self> {
        let import: UriImport = serde_json::from_value(input.clone())
            .map_err(|e| ServiceError::InvalidRequest(format!("invalid import task input: {e}")))?;
        let scheme_ok = ["file://", "http://", "https://"]
            .iter()
            .any(|s| import.import_from.starts_with(s));
        if !scheme_ok {
            return Err(ServiceError::InvalidRequest(format!(
                "unsupported import_from uri '{}'",
                import.import_from
            )));
        }
        validate_user_properties(&import.image_properties)?;
        Ok(import)
    }
}

fn join(stores: &[String]) -> String {
    stores.join(",")
}

// == Importer ==
#[derive(Clone)]
pub struct Importer {
    registry: Arc<Registry>,
    stores: StoreRegistry,
    staging: StagingArea,
    enabled_methods: Vec<String>,
    all_stores_must_succeed: bool,
    size_cap: u64,
    file_root: Option<PathBuf>,
}

impl Importer {
    pub fn new(
        registry: Arc<Registry>,
        stores: StoreRegistry,
        staging: StagingArea,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            stores,
            staging,
            enabled_methods: config.enabled_import_methods.clone(),
            all_stores_must_succeed: config.all_stores_must_succeed,
            size_cap: config.image_size_cap,
            file_root: config.import_file_root.clone(),
        }
    }

    pub fn enabled_methods(&self) -> &[String] {
        &self.enabled_methods
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Validates an import request against the image and the enabled
    /// methods and stores. Nothing is modified.
    pub async fn prepare(
        &self,
        image_id: Uuid,
        method: &str,
        stores: Option<Vec<String>>,
        all_stores_must_succeed: Option<bool>,
    ) -> Result<ImportRequest> {
        if !self.enabled_methods.iter().any(|m| m == method) {
            return Err(ServiceError::InvalidRequest(format!(
                "import method '{method}' is not enabled"
            )));
        }
        let method: ImportMethod = method.parse()?;
        let image = self.registry.get_image(image_id)?;

        if !image.list_property(IMPORTING_TO_STORES_PROPERTY).is_empty() {
            return Err(ServiceError::Conflict(format!(
                "image {image_id} already has an import in progress"
            )));
        }

        let requested = match stores {
            Some(stores) if !stores.is_empty() => stores,
            _ => vec![self.stores.default_name().to_string()],
        };
        let mut targets: Vec<String> = Vec::new();
        for store in requested {
            if !self.stores.contains(&store) {
                return Err(ServiceError::InvalidRequest(format!(
                    "store '{store}' is not enabled"
                )));
            }
            if !targets.contains(&store) {
                targets.push(store);
            }
        }

        match method {
            ImportMethod::GlanceDirect => {
                if image.status != ImageStatus::Uploading {
                    return Err(ServiceError::Conflict(format!(
                        "image {image_id} is {}, glance-direct needs staged data",
                        image.status
                    )));
                }
                if !self.staging.contains(image_id).await? {
                    return Err(ServiceError::Conflict(format!(
                        "no staged data for image {image_id}"
                    )));
                }
            }
            ImportMethod::CopyImage => {
                if image.status != ImageStatus::Active || image.locations.is_empty() {
                    return Err(ServiceError::Conflict(format!(
                        "image {image_id} is {}, copy-image needs an active image",
                        image.status
                    )));
                }
                let existing = image.stores();
                targets.retain(|s| {
                    let present = existing.contains(s);
                    if present {
                        debug!(image_id = %image_id, store = %s, "image already in store, skipping");
                    }
                    !present
                });
                if targets.is_empty() {
                    return Err(ServiceError::InvalidRequest(format!(
                        "image {image_id} is already present in all requested stores"
                    )));
                }
            }
        }

        Ok(ImportRequest {
            image_id,
            method,
            stores: targets,
            all_stores_must_succeed: all_stores_must_succeed
                .unwrap_or(self.all_stores_must_succeed),
        })
    }

    /// Publishes the import on the image before the task is queued. Fails
    /// with `Conflict` when a concurrent import got there first.
    pub fn begin(&self, request: &ImportRequest) -> Result<Image> {
        let (expected, next) = match request.method {
            ImportMethod::GlanceDirect => (ImageStatus::Uploading, ImageStatus::Importing),
            ImportMethod::CopyImage => (ImageStatus::Active, ImageStatus::Active),
        };
        self.registry
            .begin_import(request.image_id, &request.stores, expected, next)
    }

    /// Runs the import. Stores are written one after another in request
    /// order.
    pub async fn run(&self, request: ImportRequest) -> Result<Value> {
        let outcome = self.import(&request).await;
        if outcome.is_err() {
            self.reset(&request);
        }
        outcome
    }

    async fn import(&self, request: &ImportRequest) -> Result<Value> {
        let id = request.image_id;
        let data = match request.method {
            ImportMethod::GlanceDirect => self.staging.read(id).await?,
            ImportMethod::CopyImage => self.read_existing(id).await?,
        };

        let key = id.to_string();
        let mut remaining = request.stores.clone();
        let mut failed: Vec<String> = Vec::new();
        let mut written: Vec<Location> = Vec::new();

        for name in &request.stores {
            remaining.retain(|s| s != name);
            let store = self.stores.get(name)?;

            match store.put(&key, &data).await {
                Ok(bytes) => {
                    let location = Location {
                        store: name.clone(),
                        key: key.clone(),
                    };
                    if let Err(e) = self.registry.add_location(id, &location) {
                        warn!(
                            image_id = %id,
                            store = %name,
                            error = %e,
                            "recording location failed"
                        );
                        if let Err(del) = store.delete(&key).await {
                            warn!(
                                image_id = %id,
                                store = %name,
                                error = %del,
                                "failed to delete imported data"
                            );
                        }
                        self.revert(id, &written).await;
                        return Err(e);
                    }
                    written.push(location);
                    self.registry.set_properties(
                        id,
                        &[(IMPORTING_TO_STORES_PROPERTY, Some(join(&remaining)))],
                    )?;
                    info!(image_id = %id, store = %name, bytes, "image imported to store");
                }
                Err(e) => {
                    warn!(image_id = %id, store = %name, error = %e, "import to store failed");
                    failed.push(name.clone());
                    self.registry.set_properties(
                        id,
                        &[
                            (IMPORTING_TO_STORES_PROPERTY, Some(join(&remaining))),
                            (FAILED_IMPORT_PROPERTY, Some(join(&failed))),
                        ],
                    )?;
                    if request.all_stores_must_succeed {
                        self.revert(id, &written).await;
                        return Err(ServiceError::Store(format!(
                            "import of image {id} to store '{name}' failed: {e}"
                        )));
                    }
                }
            }
        }

        if written.is_empty() {
            return Err(ServiceError::Store(format!(
                "import of image {id} failed for every store"
            )));
        }

        if request.method == ImportMethod::GlanceDirect {
            self.registry.set_size(id, data.len() as u64)?;
            self.registry.update_status(id, ImageStatus::Active)?;
            if let Err(e) = self.staging.remove(id).await {
                warn!(image_id = %id, error = %e, "failed to remove staged data");
            }
        }

        info!(
            image_id = %id,
            stores = written.len(),
            failed = failed.len(),
            "image import finished"
        );
        Ok(json!({ "image_id": id }))
    }

    async fn read_existing(&self, id: Uuid) -> Result<Vec<u8>> {
        let image = self.registry.get_image(id)?;
        let location = image
            .locations
            .first()
            .ok_or_else(|| ServiceError::Conflict(format!("image {id} has no data")))?;
        self.stores.get(&location.store)?.get(&location.key).await
    }

    /// Deletes data written by an aborted import and drops its locations.
    async fn revert(&self, id: Uuid, written: &[Location]) {
        for location in written {
            match self.stores.get(&location.store) {
                Ok(store) => {
                    if let Err(e) = store.delete(&location.key).await {
                        warn!(image_id = %id, store = %location.store, error = %e, "failed to delete imported data");
                    }
                }
                Err(e) => warn!(image_id = %id, error = %e, "store vanished during revert"),
            }
            if let Err(e) = self.registry.remove_location(id, location) {
                warn!(image_id = %id, store = %location.store, error = %e, "failed to remove location");
            }
        }
    }

    /// Clears the in-progress marker and returns a glance-direct image to
    /// `uploading` so the staged data can be imported again.
    pub fn reset(&self, request: &ImportRequest) {
        let id = request.image_id;
        if let Err(e) = self
            .registry
            .set_properties(id, &[(IMPORTING_TO_STORES_PROPERTY, Some(String::new()))])
        {
            warn!(image_id = %id, error = %e, "failed to clear import progress");
        }
        if request.method == ImportMethod::GlanceDirect {
            if let Err(e) = self.registry.update_status(id, ImageStatus::Uploading) {
                warn!(image_id = %id, error = %e, "failed to reset image status");
            }
        }
    }

    /// Fails image import tasks left unfinished by a previous process and
    /// releases their images. Returns the number of tasks recovered.
    pub fn recover_interrupted(&self, ttl: Duration) -> Result<usize> {
        let mut recovered = 0;
        for mut task in self.registry.list_tasks()? {
            if task.task_type != TASK_TYPE_API_IMAGE_IMPORT || task.status.is_terminal() {
                continue;
            }
            match serde_json::from_value::<ImportRequest>(task.input.clone()) {
                Ok(request) => self.reset(&request),
                Err(e) => warn!(task_id = %task.id, error = %e, "unreadable import task input"),
            }
            task.fail("import interrupted by a service restart", ttl)?;
            self.registry.save_task(&task)?;
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "interrupted imports released");
        }
        Ok(recovered)
    }

    /// Releases an import whose task could not be queued and records the
    /// task as failed.
    pub fn abandon(
        &self,
        request: &ImportRequest,
        task: &mut Task,
        reason: &str,
        ttl: Duration,
    ) -> Result<()> {
        self.reset(request);
        task.fail(reason, ttl)?;
        self.registry.save_task(task)
    }

    // == URI Import ==
    /// Creates an image from `import_from` and stores it in the default
    /// store. The image is left `killed` if fetching or storing fails.
    pub async fn import_from_uri(&self, import: UriImport) -> Result<Value> {
        let mut properties = import.image_properties.clone();
        let name = properties.remove("name");
        let visibility = match properties.remove("visibility") {
            Some(v) => v.parse()?,
            None => Visibility::default(),
        };
        let image = self.registry.create_image(NewImage {
            name,
            visibility,
            properties,
        })?;
        let id = image.id;
        self.registry.update_status(id, ImageStatus::Saving)?;

        match self.fetch_and_store(id, &import.import_from).await {
            Ok(size) => {
                self.registry.set_size(id, size)?;
                self.registry.update_status(id, ImageStatus::Active)?;
                info!(image_id = %id, size, from = %import.import_from, "image imported from uri");
                Ok(json!({ "image_id": id }))
            }
            Err(e) => {
                if let Err(kill) = self.registry.update_status(id, ImageStatus::Killed) {
                    warn!(image_id = %id, error = %kill, "failed to mark image killed");
                }
                Err(e)
            }
        }
    }

    async fn fetch_and_store(&self, id: Uuid, uri: &str) -> Result<u64> {
        let data = self.fetch(uri).await?;
        if data.len() as u64 > self.size_cap {
            return Err(ServiceError::InvalidRequest(format!(
                "image of {} bytes exceeds the size cap of {} bytes",
                data.len(),
                self.size_cap
            )));
        }
        let store = self.stores.default_store();
        let key = id.to_string();
        let size = store.put(&key, &data).await?;
        let location = Location {
            store: store.name().to_string(),
            key,
        };
        if let Err(e) = self.registry.add_location(id, &location) {
            if let Err(del) = store.delete(&location.key).await {
                warn!(image_id = %id, error = %del, "failed to delete imported data");
            }
            return Err(e);
        }
        Ok(size)
    }

    /// Reads image data from a `file://` path under the import root or an
    /// `http(s)://` URL.
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>> {
        if let Some(path) = uri.strip_prefix("file://") {
            let path = self.confined_path(uri, path).await?;
            return tokio::fs::read(&path).await.map_err(|e| {
                ServiceError::InvalidRequest(format!("cannot read '{uri}': {e}"))
            });
        }
        download(uri).await
    }

    /// Resolves `path` (symlinks and `..` included) and accepts it only
    /// inside the configured import root.
    async fn confined_path(&self, uri: &str, path: &str) -> Result<PathBuf> {
        let root = self.file_root.as_ref().ok_or_else(|| {
            ServiceError::Forbidden(format!("file imports are disabled, refusing '{uri}'"))
        })?;
        let root = tokio::fs::canonicalize(root).await.map_err(|e| {
            ServiceError::Internal(format!("import root {} is unusable: {e}", root.display()))
        })?;
        let outside =
            || ServiceError::Forbidden(format!("'{uri}' is not a file under the import root"));
        let resolved = tokio::fs::canonicalize(path).await.map_err(|_| outside())?;
        let is_file = tokio::fs::metadata(&resolved)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !resolved.starts_with(&root) || !is_file {
            return Err(outside());
        }
        Ok(resolved)
    }
}

async fn download(uri: &str) -> Result<Vec<u8>> {
    let response = reqwest::get(uri)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| ServiceError::Store(format!("download of '{uri}' failed: {e}")))?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ServiceError::Store(format!("download of '{uri}' failed: {e}")))?;
    Ok(bytes.to_vec())
}
