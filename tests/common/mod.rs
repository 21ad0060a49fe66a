//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use image_service::api::{create_router, AppState};
use image_service::backend::{ImageStore, MemoryStore, StagingArea, StoreRegistry};
use image_service::cache::driver::SqliteDriver;
use image_service::cache::{CacheLayout, ImageCache};
use image_service::migration::Migrator;
use image_service::registry::Registry;
use image_service::{Config, Result, ServiceError};

/// A running service over temp directories and caller-supplied stores.
pub struct TestService {
    pub app: Router,
    pub state: AppState,
    _dir: TempDir,
}

/// Service with two memory stores, `fast` (default) and `slow`.
pub async fn test_service() -> (TestService, Arc<MemoryStore>, Arc<MemoryStore>) {
    let fast = Arc::new(MemoryStore::new("fast"));
    let slow = Arc::new(MemoryStore::new("slow"));
    let service = service_with_stores(
        vec![
            fast.clone() as Arc<dyn ImageStore>,
            slow.clone() as Arc<dyn ImageStore>,
        ],
        "fast",
    )
    .await;
    (service, fast, slow)
}

pub async fn service_with_stores(stores: Vec<Arc<dyn ImageStore>>, default: &str) -> TestService {
    let dir = tempfile::tempdir().unwrap();

    let registry = Registry::open(&dir.path().join("registry.db")).unwrap();
    Migrator::new(&registry).sync().unwrap();

    let layout = CacheLayout::new(dir.path().join("cache"));
    layout.ensure_dirs().unwrap();
    let driver = SqliteDriver::open(&dir.path().join("cache").join("cache.db")).unwrap();
    let cache = ImageCache::with_driver(layout, Box::new(driver), 1 << 20, Duration::from_secs(3600));

    let stores = StoreRegistry::new(stores, default).unwrap();
    let staging = StagingArea::new(dir.path().join("staging")).await.unwrap();

    let state = AppState::new(
        Config::default(),
        Arc::new(cache),
        Arc::new(registry),
        stores,
        staging,
    );
    TestService {
        app: create_router(state.clone()),
        state,
        _dir: dir,
    }
}

impl TestService {
    /// Sends a request and returns the status and the JSON body (Null when
    /// the body is empty).
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    pub async fn send_raw(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    pub async fn create_image(&self, body: &str) -> String {
        let (status, json) = self.send(post_json("/v2/images", body)).await;
        assert_eq!(status, StatusCode::CREATED, "{json}");
        json["id"].as_str().unwrap().to_string()
    }

    /// Polls a task until it is `success` or `failure`.
    pub async fn wait_for_task(&self, task_id: &str) -> Value {
        for _ in 0..200 {
            let (status, task) = self.send(get(&format!("/v2/tasks/{task_id}"))).await;
            assert_eq!(status, StatusCode::OK);
            if task["status"] == "success" || task["status"] == "failure" {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} did not finish");
    }
}

// == Request builders ==

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn put_bytes(uri: &str, data: &[u8]) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/octet-stream")
        .body(Body::from(data.to_vec()))
        .unwrap()
}

pub fn put_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

// == Failing store ==

/// A store that refuses every write.
pub struct FailingStore {
    name: String,
}

impl FailingStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl ImageStore for FailingStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, _key: &str, _data: &[u8]) -> Result<u64> {
        Err(ServiceError::Store(format!("store '{}' is unreachable", self.name)))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        Err(ServiceError::NotFound(format!("object '{key}' not found")))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        Ok(false)
    }
}
