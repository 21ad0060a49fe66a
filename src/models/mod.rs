//! Request and Response models for the image service API
//!
//! This module defines the DTOs (Data Transfer Objects) used for
//! serializing/deserializing HTTP request and response bodies. Images and
//! tasks are returned as their registry types directly.

pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use requests::{
    ClearTarget, CreateImageRequest, CreateTaskRequest, ImportImageRequest, ImportMethodSpec,
};
pub use responses::{
    CacheListResponse, CachedImage, ClearCacheResponse, HealthResponse, ImageListResponse,
    ImportInfoResponse, StatsResponse, StoreInfo, StoresResponse, TaskListResponse, ValueList,
};
