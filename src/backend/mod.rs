//! Backing Stores Module
//!
//! Authoritative storage for image data. Images may have locations in more
//! than one named store; the local image cache sits in front of them.

mod filesystem;
mod memory;
mod staging;

pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;
pub use staging::StagingArea;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::Config;
use crate::error::{Result, ServiceError};

/// Object storage for image data, addressed by key.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Store name as configured in `enabled_backends`.
    fn name(&self) -> &str;

    /// Store type (`file`, `memory`).
    fn kind(&self) -> &'static str;

    /// Writes `data` under `key`, replacing any existing object. Returns the
    /// number of bytes stored.
    async fn put(&self, key: &str, data: &[u8]) -> Result<u64>;

    /// Reads the whole object.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Deletes the object. Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Rejects keys that could escape a store's root.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.contains("..")
        || key.contains('/')
        || key.contains('\\')
        || key.starts_with('.')
    {
        return Err(ServiceError::InvalidRequest(format!("invalid object key '{key}'")));
    }
    Ok(())
}

// == Store Registry ==
/// The set of enabled stores, keyed by name.
#[derive(Clone)]
pub struct StoreRegistry {
    stores: BTreeMap<String, Arc<dyn ImageStore>>,
    default_store: String,
}

impl StoreRegistry {
    /// Builds the registry from `enabled_backends`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let mut stores: BTreeMap<String, Arc<dyn ImageStore>> = BTreeMap::new();
        for spec in &config.enabled_backends {
            let store: Arc<dyn ImageStore> = match spec.kind.as_str() {
                "file" => Arc::new(
                    FilesystemStore::new(
                        &spec.name,
                        config.filesystem_store_datadir.join(&spec.name),
                    )
                    .await?,
                ),
                "memory" => Arc::new(MemoryStore::new(&spec.name)),
                other => {
                    return Err(ServiceError::InvalidRequest(format!(
                        "store '{}' has unsupported type '{other}'",
                        spec.name
                    )))
                }
            };
            info!(store = %spec.name, kind = %spec.kind, "backing store enabled");
            stores.insert(spec.name.clone(), store);
        }
        Self::new(stores.into_values().collect(), &config.default_backend)
    }

    /// Builds a registry from ready-made stores.
    pub fn new(stores: Vec<Arc<dyn ImageStore>>, default_store: &str) -> Result<Self> {
        let stores: BTreeMap<String, Arc<dyn ImageStore>> = stores
            .into_iter()
            .map(|s| (s.name().to_string(), s))
            .collect();
        if !stores.contains_key(default_store) {
            return Err(ServiceError::InvalidRequest(format!(
                "default store '{default_store}' is not enabled"
            )));
        }
        Ok(Self {
            stores,
            default_store: default_store.to_string(),
        })
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ImageStore>> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::InvalidRequest(format!("store '{name}' is not enabled")))
    }

    pub fn default_store(&self) -> Arc<dyn ImageStore> {
        // Presence checked in `new`.
        self.stores[&self.default_store].clone()
    }

    pub fn default_name(&self) -> &str {
        &self.default_store
    }

    pub fn names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ImageStore>> {
        self.stores.values()
    }
}
