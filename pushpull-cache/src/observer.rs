//! Query observers.

use std::sync::Arc;

use pushpull_core::{FetchError, QueryKey, Value};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::client::ClientInner;
use crate::options::QueryOptions;
use crate::state::QueryState;

/// A live view of one cache entry.
///
/// While an observer exists its entry is not garbage collected. Observers see
/// the latest state; intermediate states written in quick succession may be
/// coalesced. Use the cache's event listeners when every write matters.
pub struct QueryObserver {
    inner: Arc<ClientInner>,
    query_hash: String,
    options: QueryOptions,
    receiver: watch::Receiver<QueryState>,
}

impl QueryObserver {
    pub(crate) fn new(
        inner: Arc<ClientInner>,
        query_hash: String,
        options: QueryOptions,
        receiver: watch::Receiver<QueryState>,
    ) -> Self {
        Self {
            inner,
            query_hash,
            options,
            receiver,
        }
    }

    pub fn query_hash(&self) -> &str {
        &self.query_hash
    }

    pub fn query_key(&self) -> &QueryKey {
        &self.options.query_key
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    pub fn state(&self) -> QueryState {
        self.receiver.borrow().clone()
    }

    pub fn data(&self) -> Option<Value> {
        self.receiver.borrow().data.clone()
    }

    /// Wait for the next state change.
    ///
    /// Returns `None` once the entry has been removed from the cache.
    pub async fn changed(&mut self) -> Option<QueryState> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Wait until the state satisfies `predicate`, checking the current state first.
    pub async fn wait_for(
        &mut self,
        predicate: impl FnMut(&QueryState) -> bool,
    ) -> Option<QueryState> {
        self.receiver
            .wait_for(predicate)
            .await
            .ok()
            .map(|state| state.clone())
    }

    /// Stream of states, starting with the current one.
    pub fn stream(&self) -> WatchStream<QueryState> {
        WatchStream::new(self.receiver.clone())
    }

    /// Run the query function again regardless of staleness.
    pub async fn refetch(&self) -> Result<Value, FetchError> {
        self.inner.fetch(&self.options, true).await
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.inner
            .remove_observer(&self.query_hash, self.options.enabled);
    }
}

impl std::fmt::Debug for QueryObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryObserver")
            .field("query_hash", &self.query_hash)
            .field("enabled", &self.options.enabled)
            .field("state", &*self.receiver.borrow())
            .finish()
    }
}
