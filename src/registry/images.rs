//! Image records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::Registry;
use crate::clock;
use crate::error::{Result, ServiceError};

/// Property namespace owned by the service.
pub const RESERVED_PREFIX: &str = "os_glance_";
/// Stores an import is still working on, comma separated.
pub const IMPORTING_TO_STORES_PROPERTY: &str = "os_glance_importing_to_stores";
/// Stores an import failed to write, comma separated.
pub const FAILED_IMPORT_PROPERTY: &str = "os_glance_failed_import";

// == Image Status ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Queued,
    Saving,
    Uploading,
    Importing,
    Active,
    Killed,
    Deleted,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Queued => "queued",
            ImageStatus::Saving => "saving",
            ImageStatus::Uploading => "uploading",
            ImageStatus::Importing => "importing",
            ImageStatus::Active => "active",
            ImageStatus::Killed => "killed",
            ImageStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStatus {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(ImageStatus::Queued),
            "saving" => Ok(ImageStatus::Saving),
            "uploading" => Ok(ImageStatus::Uploading),
            "importing" => Ok(ImageStatus::Importing),
            "active" => Ok(ImageStatus::Active),
            "killed" => Ok(ImageStatus::Killed),
            "deleted" => Ok(ImageStatus::Deleted),
            other => Err(ServiceError::InvalidRequest(format!(
                "unknown image status '{other}'"
            ))),
        }
    }
}

// == Visibility ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
    #[default]
    Shared,
    Community,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
            Visibility::Shared => "shared",
            Visibility::Community => "community",
        }
    }
}

impl FromStr for Visibility {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            "shared" => Ok(Visibility::Shared),
            "community" => Ok(Visibility::Community),
            other => Err(ServiceError::InvalidRequest(format!(
                "unknown visibility '{other}'"
            ))),
        }
    }
}

/// Where a copy of the image data lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub store: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: Uuid,
    pub name: Option<String>,
    pub status: ImageStatus,
    pub visibility: Visibility,
    pub size: Option<u64>,
    pub properties: BTreeMap<String, String>,
    pub locations: Vec<Location>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Image {
    /// Names of the stores holding a copy of the data.
    pub fn stores(&self) -> Vec<String> {
        self.locations.iter().map(|l| l.store.clone()).collect()
    }

    /// Comma separated list property, empty entries dropped.
    pub fn list_property(&self, key: &str) -> Vec<String> {
        self.properties
            .get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Fields accepted when creating an image.
#[derive(Debug, Clone, Default)]
pub struct NewImage {
    pub name: Option<String>,
    pub visibility: Visibility,
    pub properties: BTreeMap<String, String>,
}

/// Rejects user-supplied properties in the reserved namespace.
pub fn validate_user_properties(properties: &BTreeMap<String, String>) -> Result<()> {
    match properties.keys().find(|k| k.starts_with(RESERVED_PREFIX)) {
        Some(key) => Err(ServiceError::Forbidden(format!(
            "property '{key}' is reserved for the service"
        ))),
        None => Ok(()),
    }
}

const IMAGE_COLUMNS: &str = "SELECT id, name, status, COALESCE(visibility, 'shared'), size, \
     properties, created_at, updated_at FROM images";

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<RawImage> {
    Ok(RawImage {
        id: row.get(0)?,
        name: row.get(1)?,
        status: row.get(2)?,
        visibility: row.get(3)?,
        size: row.get(4)?,
        properties: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

struct RawImage {
    id: String,
    name: Option<String>,
    status: String,
    visibility: String,
    size: Option<i64>,
    properties: String,
    created_at: i64,
    updated_at: i64,
}

impl RawImage {
    fn into_image(self, locations: Vec<Location>) -> Result<Image> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| ServiceError::Internal(format!("bad image id '{}': {e}", self.id)))?;
        let properties: BTreeMap<String, String> = serde_json::from_str(&self.properties)
            .map_err(|e| ServiceError::Internal(format!("bad properties on image {id}: {e}")))?;
        Ok(Image {
            id,
            name: self.name,
            status: self.status.parse()?,
            visibility: self.visibility.parse()?,
            size: self.size.map(|s| s as u64),
            properties,
            locations,
            created_at: clock::from_millis(self.created_at),
            updated_at: clock::from_millis(self.updated_at),
        })
    }
}

fn load_locations(conn: &Connection, id: Uuid) -> Result<Vec<Location>> {
    let mut stmt = conn.prepare(
        "SELECT store, key FROM image_locations
         WHERE image_id = ?1 AND deleted = 0 ORDER BY id",
    )?;
    let rows = stmt.query_map([id.to_string()], |row| {
        Ok(Location {
            store: row.get(0)?,
            key: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn load_image(conn: &Connection, id: Uuid) -> Result<Image> {
    let raw = conn
        .query_row(
            &format!("{IMAGE_COLUMNS} WHERE id = ?1 AND deleted = 0"),
            [id.to_string()],
            image_from_row,
        )
        .optional()?
        .ok_or_else(|| ServiceError::NotFound(format!("image {id}")))?;
    raw.into_image(load_locations(conn, id)?)
}

/// Runs an UPDATE on a live image, failing with `NotFound` if no row changed.
fn update_image(conn: &Connection, id: Uuid, sql: &str, value: &dyn rusqlite::ToSql) -> Result<()> {
    let changed = conn.execute(
        sql,
        params![value, clock::to_millis(clock::now()), id.to_string()],
    )?;
    if changed == 0 {
        return Err(ServiceError::NotFound(format!("image {id}")));
    }
    Ok(())
}

// == Image Operations ==
impl Registry {
    /// Creates an image record in `queued` state.
    pub fn create_image(&self, new: NewImage) -> Result<Image> {
        validate_user_properties(&new.properties)?;
        let id = Uuid::new_v4();
        let now = clock::to_millis(clock::now());
        let properties = serde_json::to_string(&new.properties)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO images (id, name, status, visibility, properties, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                id.to_string(),
                new.name,
                ImageStatus::Queued.as_str(),
                new.visibility.as_str(),
                properties,
                now
            ],
        )?;
        info!(image_id = %id, "image created");
        load_image(&conn, id)
    }

    pub fn get_image(&self, id: Uuid) -> Result<Image> {
        let conn = self.conn()?;
        load_image(&conn, id)
    }

    /// All live images, oldest first.
    pub fn list_images(&self) -> Result<Vec<Image>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{IMAGE_COLUMNS} WHERE deleted = 0 ORDER BY created_at, id"
        ))?;
        let raws = stmt
            .query_map([], image_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter()
            .map(|raw| {
                let id = Uuid::parse_str(&raw.id).map_err(|e| {
                    ServiceError::Internal(format!("bad image id '{}': {e}", raw.id))
                })?;
                let locations = load_locations(&conn, id)?;
                raw.into_image(locations)
            })
            .collect()
    }

    pub fn update_status(&self, id: Uuid, status: ImageStatus) -> Result<Image> {
        let conn = self.conn()?;
        update_image(
            &conn,
            id,
            "UPDATE images SET status = ?1, updated_at = ?2 WHERE id = ?3 AND deleted = 0",
            &status.as_str(),
        )?;
        debug!(image_id = %id, %status, "image status changed");
        load_image(&conn, id)
    }

    pub fn set_size(&self, id: Uuid, size: u64) -> Result<Image> {
        let conn = self.conn()?;
        update_image(
            &conn,
            id,
            "UPDATE images SET size = ?1, updated_at = ?2 WHERE id = ?3 AND deleted = 0",
            &(size as i64),
        )?;
        load_image(&conn, id)
    }

    /// Merges `updates` into the image properties. `None` removes a key.
    ///
    /// No namespace check is made here; user input goes through
    /// [`validate_user_properties`] first.
    pub fn set_properties(
        &self,
        id: Uuid,
        updates: &[(&str, Option<String>)],
    ) -> Result<Image> {
        let conn = self.conn()?;
        let mut properties = load_image(&conn, id)?.properties;
        for (key, value) in updates {
            match value {
                Some(v) => properties.insert((*key).to_string(), v.clone()),
                None => properties.remove(*key),
            };
        }
        let encoded = serde_json::to_string(&properties)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        update_image(
            &conn,
            id,
            "UPDATE images SET properties = ?1, updated_at = ?2 WHERE id = ?3 AND deleted = 0",
            &encoded,
        )?;
        load_image(&conn, id)
    }

    /// Claims the image for an import to `stores`: it must be in `expected`
    /// state with no import in progress. Publishes the target stores, clears
    /// earlier failures and moves the image to `next`, all in one write
    /// transaction so concurrent claims from any node see each other.
    pub fn begin_import(
        &self,
        id: Uuid,
        stores: &[String],
        expected: ImageStatus,
        next: ImageStatus,
    ) -> Result<Image> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let image = load_image(&tx, id)?;

        let in_progress = image.list_property(IMPORTING_TO_STORES_PROPERTY);
        if !in_progress.is_empty() {
            return Err(ServiceError::Conflict(format!(
                "image {id} is already being imported to {}",
                in_progress.join(",")
            )));
        }
        if image.status != expected {
            return Err(ServiceError::Conflict(format!(
                "image {id} is {}, expected {expected}",
                image.status
            )));
        }

        let mut properties = image.properties;
        properties.insert(IMPORTING_TO_STORES_PROPERTY.to_string(), stores.join(","));
        properties.insert(FAILED_IMPORT_PROPERTY.to_string(), String::new());
        let encoded = serde_json::to_string(&properties)
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        tx.execute(
            "UPDATE images SET properties = ?1, status = ?2, updated_at = ?3
             WHERE id = ?4 AND deleted = 0",
            params![
                encoded,
                next.as_str(),
                clock::to_millis(clock::now()),
                id.to_string()
            ],
        )?;
        let image = load_image(&tx, id)?;
        tx.commit()?;

        debug!(image_id = %id, stores = %stores.join(","), status = %next, "import claimed");
        Ok(image)
    }

    pub fn add_location(&self, id: Uuid, location: &Location) -> Result<Image> {
        let conn = self.conn()?;
        load_image(&conn, id)?;
        conn.execute(
            "INSERT INTO image_locations (image_id, store, key, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                id.to_string(),
                location.store,
                location.key,
                clock::to_millis(clock::now())
            ],
        )?;
        debug!(image_id = %id, store = %location.store, "location added");
        load_image(&conn, id)
    }

    /// Soft deletes the matching location. Returns the updated image.
    pub fn remove_location(&self, id: Uuid, location: &Location) -> Result<Image> {
        let conn = self.conn()?;
        let now = clock::to_millis(clock::now());
        conn.execute(
            "UPDATE image_locations SET deleted = 1, deleted_at = ?1
             WHERE image_id = ?2 AND store = ?3 AND key = ?4 AND deleted = 0",
            params![now, id.to_string(), location.store, location.key],
        )?;
        load_image(&conn, id)
    }

    /// Soft deletes the image and its locations.
    pub fn delete_image(&self, id: Uuid) -> Result<Image> {
        let mut conn = self.conn()?;
        let image = load_image(&conn, id)?;
        let now = clock::to_millis(clock::now());

        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE images SET status = ?1, deleted = 1, deleted_at = ?2, updated_at = ?2
             WHERE id = ?3",
            params![ImageStatus::Deleted.as_str(), now, id.to_string()],
        )?;
        tx.execute(
            "UPDATE image_locations SET deleted = 1, deleted_at = ?1
             WHERE image_id = ?2 AND deleted = 0",
            params![now, id.to_string()],
        )?;
        tx.commit()?;

        info!(image_id = %id, "image deleted");
        Ok(Image {
            status: ImageStatus::Deleted,
            locations: Vec::new(),
            ..image
        })
    }
}
