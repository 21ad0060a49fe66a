//! In-memory store, for development setups and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{validate_key, ImageStore};
use crate::error::{Result, ServiceError};

pub struct MemoryStore {
    name: String,
    objects: RwLock<HashMap<String, Vec<u8>>>,
    reads: AtomicU64,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            objects: RwLock::new(HashMap::new()),
            reads: AtomicU64::new(0),
        }
    }

    /// Number of successful `get` calls served so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ImageStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<u64> {
        validate_key(key)?;
        self.objects
            .write()
            .await
            .insert(key.to_string(), data.to_vec());
        Ok(data.len() as u64)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let data = self
            .objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| {
                ServiceError::NotFound(format!("object '{key}' in store '{}'", self.name))
            })?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(data)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }
}
