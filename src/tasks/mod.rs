//! Tasks Module
//!
//! Asynchronous units of work tracked as task resources.
//!
//! # Components
//! - `Task`: the entity and its state machine
//! - `TaskExecutor`: serial, parallel or pooled execution
//! - `Importer`: the image import workflows run by tasks

mod executor;
mod import;
mod model;

pub use executor::{Job, TaskExecutor, TaskHandle};
pub use import::{ImportMethod, ImportRequest, Importer, UriImport};
pub use model::{Task, TaskStatus, TASK_TYPE_API_IMAGE_IMPORT, TASK_TYPE_IMPORT};
