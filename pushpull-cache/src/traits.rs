//! The pull-cache contract.
//!
//! This is the narrow surface a push-to-pull bridge needs from a cache: it
//! installs its hash and fetch functions once, writes pushed values straight
//! into entries, and learns when entries go away.

use pushpull_core::{FetchError, QueryKey, Value};

use crate::events::{CacheListener, ListenerId};
use crate::options::{KeyHashFn, QueryFn};

/// Cache operations a bridge programs against.
///
/// Implementations must be thread-safe and must invoke event listeners
/// without holding locks that `set_query_data` or `set_query_error` need.
pub trait PullCache: Send + Sync + 'static {
    /// Install the global key hashing strategy.
    fn set_key_hash_fn(&self, hash_fn: KeyHashFn);

    /// Install the fetch function used when a query carries none.
    fn set_default_query_fn(&self, query_fn: QueryFn);

    /// Hash a key with the installed strategy.
    fn hash_key(&self, key: &QueryKey) -> String;

    /// Replace the value for `key`, clearing its error state.
    fn set_query_data(&self, key: &QueryKey, data: Value);

    /// Put the entry for `key` into the error state. No-op without an entry.
    fn set_query_error(&self, key: &QueryKey, error: FetchError);

    /// Current value for `key`, if any.
    fn query_data(&self, key: &QueryKey) -> Option<Value>;

    /// Register an event listener.
    fn subscribe_events(&self, listener: CacheListener) -> ListenerId;

    /// Remove an event listener. Unknown ids are ignored.
    fn unsubscribe_events(&self, id: ListenerId);
}
