//! Background Workers Module
//!
//! Periodic jobs that run inside the server process.
//!
//! # Workers
//! - Prefetch: fetches queued images into the cache
//! - Maintenance: expires finished tasks, and optionally prunes and cleans
//!   the cache when no external scheduler does

mod maintenance;
mod prefetch;

pub use maintenance::{run_maintenance, spawn_maintenance_task, MaintenanceReport};
pub use prefetch::spawn_prefetch_task;
