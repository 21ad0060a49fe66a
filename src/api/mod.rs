//! API Module
//!
//! HTTP handlers and routing for the image service REST API.
//!
//! # Endpoints
//! - `GET /health`, `GET /stats` - Health check and cache statistics
//! - `/v2/images` - Image records, data upload/download, staging and import
//! - `/v2/info/import`, `/v2/info/stores` - Discovery
//! - `/v2/tasks` - Task creation and status
//! - `/v2/cache` - Cache management (list, queue, delete, clear)

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
