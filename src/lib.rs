//! Image Service - image registry with a node-local image cache
//!
//! Serves image data through an LRU cache in front of one or more backing
//! stores, runs image imports as asynchronous tasks and upgrades its
//! registry schema in expand/migrate/contract phases.

pub mod api;
pub mod backend;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod migration;
pub mod models;
pub mod registry;
pub mod tasks;
pub mod workers;

pub use api::AppState;
pub use config::Config;
pub use error::{Result, ServiceError};
