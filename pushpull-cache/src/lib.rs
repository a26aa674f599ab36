//! PUSHPULL Cache - Pull-based query cache
//!
//! An in-process query client in the style of TanStack Query: query keys map
//! to entries filled by fetch functions on demand, observers keep entries
//! alive, unobserved entries are garbage collected, and concurrent fetches
//! share one call. The [`PullCache`] trait is the narrow contract a push
//! bridge programs against.

pub mod client;
pub mod events;
pub mod mutation;
pub mod observer;
pub mod options;
pub mod state;
pub mod traits;

pub use client::{CacheStats, QueryClient};
pub use events::{CacheEvent, CacheListener, ListenerId};
pub use mutation::{MutationObserver, MutationState, MutationStatus};
pub use observer::QueryObserver;
pub use options::{
    CacheConfig, KeyHashFn, MutationFn, MutationOptions, QueryFn, QueryFnContext, QueryFuture,
    QueryOptions, StaleTime,
};
pub use state::{FetchStatus, QueryState, QueryStatus};
pub use traits::PullCache;
