//! Cache Index Drivers
//!
//! The index records metadata for every entry in the cache directory. Data
//! files are moved between state directories by [`crate::cache::ImageCache`];
//! drivers only persist the metadata.

mod sqlite;
mod extattr;

pub use self::sqlite::SqliteDriver;
pub use self::extattr::XattrDriver;

use uuid::Uuid;

use crate::cache::{CacheEntry, EntryState};
use crate::error::Result;

/// Index backend for the image cache.
///
/// Implementations must be safe to share between the API server's request
/// handlers and its background workers.
pub trait CacheDriver: Send + Sync + std::fmt::Debug {
    /// Short name for logs and the stats endpoint.
    fn name(&self) -> &'static str;

    /// Looks up one entry.
    fn get(&self, image_id: Uuid) -> Result<Option<CacheEntry>>;

    /// Lists entries, optionally restricted to one state.
    fn list(&self, state: Option<EntryState>) -> Result<Vec<CacheEntry>>;

    /// Inserts or replaces an entry. The entry's file must already be at
    /// the location for its state.
    fn upsert(&self, entry: &CacheEntry) -> Result<()>;

    /// Records a cache hit. Returns the updated entry, or None if absent.
    fn touch(&self, image_id: Uuid) -> Result<Option<CacheEntry>>;

    /// Removes an entry's metadata. Returns true if something was removed.
    fn remove(&self, image_id: Uuid) -> Result<bool>;
}
