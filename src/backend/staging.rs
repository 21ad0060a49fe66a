//! Staging area for the interoperable import flow.
//!
//! Data uploaded with the `stage` call waits here, on the node that received
//! it, until an import task copies it into the target stores.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, ServiceError};

#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Opens the staging directory named by `node_staging_uri`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.staging_dir()?).await
    }

    fn path(&self, image_id: Uuid) -> PathBuf {
        self.root.join(image_id.to_string())
    }

    /// Stages image data, replacing earlier staged data for the image.
    pub async fn stage(&self, image_id: Uuid, data: &[u8]) -> Result<u64> {
        let mut file = fs::File::create(self.path(image_id)).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        debug!(%image_id, bytes = data.len(), "image data staged");
        Ok(data.len() as u64)
    }

    pub async fn read(&self, image_id: Uuid) -> Result<Vec<u8>> {
        fs::read(self.path(image_id)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ServiceError::NotFound(format!("no staged data for image {image_id}"))
            } else {
                e.into()
            }
        })
    }

    pub async fn contains(&self, image_id: Uuid) -> Result<bool> {
        Ok(fs::try_exists(self.path(image_id)).await?)
    }

    pub async fn remove(&self, image_id: Uuid) -> Result<()> {
        match fs::remove_file(self.path(image_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
