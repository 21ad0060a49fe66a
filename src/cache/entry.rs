//! Cache Entry Module
//!
//! Defines the index record for a single image in the local cache.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock;
use crate::error::ServiceError;

// == Entry State ==
/// Lifecycle state of a cache entry.
///
/// `queued -> caching -> cached`, with `caching -> stalled` when a write never
/// completes and `caching -> invalid` when it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Queued,
    Caching,
    Cached,
    Stalled,
    Invalid,
}

impl EntryState {
    pub const ALL: [EntryState; 5] = [
        EntryState::Queued,
        EntryState::Caching,
        EntryState::Cached,
        EntryState::Stalled,
        EntryState::Invalid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Queued => "queued",
            EntryState::Caching => "caching",
            EntryState::Cached => "cached",
            EntryState::Stalled => "stalled",
            EntryState::Invalid => "invalid",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryState {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ServiceError::Internal(format!("unknown cache entry state '{s}'")))
    }
}

// == Cache Entry ==
/// Represents a single cached (or queued) image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Image identifier, the key of the index
    pub image_id: Uuid,
    /// Size of the cached payload in bytes (0 until cached)
    pub size_bytes: u64,
    /// When the entry was first recorded
    pub created_at: DateTime<Utc>,
    /// Last time the entry was served or written
    pub last_accessed_at: DateTime<Utc>,
    /// Number of reads served from the cache
    pub hit_count: u64,
    /// Lifecycle state
    pub state: EntryState,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new entry in the given state, timestamped now.
    pub fn new(image_id: Uuid, state: EntryState) -> Self {
        let now = clock::now();
        Self {
            image_id,
            size_bytes: 0,
            created_at: now,
            last_accessed_at: now,
            hit_count: 0,
            state,
        }
    }

    /// Returns the entry in a new state, keeping its history.
    pub fn with_state(mut self, state: EntryState) -> Self {
        self.state = state;
        self
    }

    /// Records a completed write of `size_bytes`.
    pub fn into_cached(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self.state = EntryState::Cached;
        self.last_accessed_at = clock::now();
        self
    }

    /// Records a read served from the cache.
    pub fn record_hit(&mut self) {
        self.hit_count += 1;
        self.last_accessed_at = clock::now();
    }

    /// True for entries that count against the cache ceiling.
    pub fn is_cached(&self) -> bool {
        self.state == EntryState::Cached
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_creation() {
        let id = Uuid::new_v4();
        let entry = CacheEntry::new(id, EntryState::Queued);

        assert_eq!(entry.image_id, id);
        assert_eq!(entry.size_bytes, 0);
        assert_eq!(entry.hit_count, 0);
        assert_eq!(entry.created_at, entry.last_accessed_at);
        assert!(!entry.is_cached());
    }

    #[test]
    fn test_into_cached_sets_size() {
        let entry = CacheEntry::new(Uuid::new_v4(), EntryState::Caching).into_cached(42);

        assert_eq!(entry.size_bytes, 42);
        assert!(entry.is_cached());
    }

    #[test]
    fn test_record_hit() {
        let mut entry = CacheEntry::new(Uuid::new_v4(), EntryState::Cached);
        let before = entry.last_accessed_at;

        entry.record_hit();
        entry.record_hit();

        assert_eq!(entry.hit_count, 2);
        assert!(entry.last_accessed_at >= before);
    }

    #[test]
    fn test_state_string_round_trip() {
        for state in EntryState::ALL {
            assert_eq!(state.as_str().parse::<EntryState>().unwrap(), state);
        }
        assert!("evicted".parse::<EntryState>().is_err());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&EntryState::Stalled).unwrap();
        assert_eq!(json, "\"stalled\"");
    }
}
