//! Local filesystem store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{validate_key, ImageStore};
use crate::error::{Result, ServiceError};

/// Store keeping one file per image under a root directory.
pub struct FilesystemStore {
    name: String,
    root: PathBuf,
}

impl FilesystemStore {
    /// Creates the store, creating its root directory if needed.
    pub async fn new(name: &str, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            name: name.to_string(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ImageStore for FilesystemStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "file"
    }

    #[instrument(skip(self, data), fields(store = %self.name, bytes = data.len()))]
    async fn put(&self, key: &str, data: &[u8]) -> Result<u64> {
        let path = self.key_path(key)?;
        // Write to a temp file first so readers never see a partial object.
        let tmp = self.root.join(format!(".tmp-{}", Uuid::new_v4()));

        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(ServiceError::Store(format!(
                "failed to write '{key}' to store '{}': {e}",
                self.name
            )));
        }

        debug!(key, "object stored");
        Ok(data.len() as u64)
    }

    #[instrument(skip(self), fields(store = %self.name))]
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.key_path(key)?;
        fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ServiceError::NotFound(format!("object '{key}' in store '{}'", self.name))
            } else {
                ServiceError::Store(format!(
                    "failed to read '{key}' from store '{}': {e}",
                    self.name
                ))
            }
        })
    }

    #[instrument(skip(self), fields(store = %self.name))]
    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServiceError::Store(format!(
                "failed to delete '{key}' from store '{}': {e}",
                self.name
            ))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.key_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }
}
