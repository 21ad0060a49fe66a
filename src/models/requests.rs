//! Request DTOs for the image service API
//!
//! Defines the structure of incoming HTTP request bodies.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, ServiceError};
use crate::registry::{NewImage, Visibility};

/// Request body for POST /v2/images
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateImageRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    /// Free-form image properties
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl CreateImageRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if matches!(&self.name, Some(name) if name.len() > 255) {
            return Some("Image name exceeds maximum length of 255 characters".to_string());
        }
        if self.properties.keys().any(|k| k.is_empty()) {
            return Some("Property names cannot be empty".to_string());
        }
        None
    }
}

impl From<CreateImageRequest> for NewImage {
    fn from(req: CreateImageRequest) -> Self {
        NewImage {
            name: req.name,
            visibility: req.visibility.unwrap_or_default(),
            properties: req.properties,
        }
    }
}

/// Import method selector, `{"name": "glance-direct"}`
#[derive(Debug, Clone, Deserialize)]
pub struct ImportMethodSpec {
    pub name: String,
}

/// Request body for POST /v2/images/:id/import
#[derive(Debug, Clone, Deserialize)]
pub struct ImportImageRequest {
    pub method: ImportMethodSpec,
    /// Target stores; the default store when absent
    #[serde(default)]
    pub stores: Option<Vec<String>>,
    /// Overrides the configured completion policy
    #[serde(default)]
    pub all_stores_must_succeed: Option<bool>,
}

/// Request body for POST /v2/tasks
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub input: Value,
}

/// Target of DELETE /v2/cache, read from `x-image-cache-clear-target`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearTarget {
    Cache,
    Queue,
    Both,
}

impl ClearTarget {
    pub const HEADER: &'static str = "x-image-cache-clear-target";

    /// Parses the header value; a missing header clears both.
    pub fn from_header(value: Option<&str>) -> Result<Self> {
        match value.map(str::trim) {
            None | Some("") | Some("both") => Ok(Self::Both),
            Some("cache") => Ok(Self::Cache),
            Some("queue") => Ok(Self::Queue),
            Some(other) => Err(ServiceError::InvalidRequest(format!(
                "invalid {} header '{other}', expected cache, queue or both",
                Self::HEADER
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Queue => "queue",
            Self::Both => "both",
        }
    }

    pub fn clears_cache(self) -> bool {
        matches!(self, Self::Cache | Self::Both)
    }

    pub fn clears_queue(self) -> bool {
        matches!(self, Self::Queue | Self::Both)
    }
}
