//! Query cache events.
//!
//! Listeners are invoked synchronously, after the cache has released its
//! internal locks, in the order events occurred.

use std::sync::Arc;

use pushpull_core::QueryKey;

use crate::state::QueryStatus;

/// Something that happened to a cache entry.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// A new entry was created.
    Added {
        query_hash: String,
        query_key: QueryKey,
    },

    /// An entry was removed (garbage collected or explicitly).
    Removed {
        query_hash: String,
        query_key: QueryKey,
    },

    /// An entry's state changed.
    Updated {
        query_hash: String,
        status: QueryStatus,
    },

    /// An observer attached to an entry.
    ObserverAdded { query_hash: String, observers: usize },

    /// An observer detached from an entry.
    ObserverRemoved { query_hash: String, observers: usize },
}

impl CacheEvent {
    pub fn query_hash(&self) -> &str {
        match self {
            CacheEvent::Added { query_hash, .. }
            | CacheEvent::Removed { query_hash, .. }
            | CacheEvent::Updated { query_hash, .. }
            | CacheEvent::ObserverAdded { query_hash, .. }
            | CacheEvent::ObserverRemoved { query_hash, .. } => query_hash,
        }
    }

    /// Short name used in logs.
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::Added { .. } => "added",
            CacheEvent::Removed { .. } => "removed",
            CacheEvent::Updated { .. } => "updated",
            CacheEvent::ObserverAdded { .. } => "observer_added",
            CacheEvent::ObserverRemoved { .. } => "observer_removed",
        }
    }
}

/// Callback receiving cache events.
pub type CacheListener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);
