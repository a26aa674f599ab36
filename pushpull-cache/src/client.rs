//! In-process query client.
//!
//! Entries are keyed by the hash of their query key. Each entry owns a
//! `watch` channel carrying its [`QueryState`], so observers see the latest
//! state without polling. Fetches are deduplicated per entry through a shared
//! future and driven on the ambient tokio runtime, so a fetch started by one
//! caller completes even if that caller stops waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use pushpull_core::{canonical_json, FetchError, QueryKey, Value};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::events::{CacheEvent, CacheListener, ListenerId};
use crate::mutation::MutationObserver;
use crate::observer::QueryObserver;
use crate::options::{
    CacheConfig, KeyHashFn, MutationOptions, QueryFn, QueryFnContext, QueryOptions, StaleTime,
};
use crate::state::{FetchStatus, QueryState};
use crate::traits::PullCache;

type SharedFetch = Shared<BoxFuture<'static, Result<Value, FetchError>>>;

/// Point-in-time counters for a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub observers: usize,
    pub fetching: usize,
    pub listeners: usize,
}

#[derive(Default)]
struct Hooks {
    key_hash_fn: Option<KeyHashFn>,
    default_query_fn: Option<QueryFn>,
}

struct QueryEntry {
    query_key: QueryKey,
    state_tx: watch::Sender<QueryState>,
    query_fn: Option<QueryFn>,
    stale_time: StaleTime,
    gc_time: Duration,
    retry: u32,
    observers: usize,
    enabled_observers: usize,
    in_flight: Option<(u64, SharedFetch)>,
    /// Bumped whenever a pending collection must be abandoned.
    gc_epoch: u64,
}

impl QueryEntry {
    fn new(query_key: QueryKey, state: QueryState, config: &CacheConfig) -> Self {
        let (state_tx, _) = watch::channel(state);
        Self {
            query_key,
            state_tx,
            query_fn: None,
            stale_time: config.default_stale_time,
            gc_time: config.default_gc_time,
            retry: config.default_retry,
            observers: 0,
            enabled_observers: 0,
            in_flight: None,
            gc_epoch: 0,
        }
    }

    fn apply(&mut self, options: &QueryOptions) {
        if let Some(query_fn) = &options.query_fn {
            self.query_fn = Some(query_fn.clone());
        }
        if let Some(stale_time) = options.stale_time {
            self.stale_time = stale_time;
        }
        if let Some(gc_time) = options.gc_time {
            self.gc_time = gc_time;
        }
        if let Some(retry) = options.retry {
            self.retry = retry;
        }
    }

    fn fresh_data(&self) -> Option<Value> {
        let state = self.state_tx.borrow();
        if state.is_stale(self.stale_time) {
            None
        } else {
            state.data.clone()
        }
    }

    fn updated_event(&self, query_hash: &str) -> CacheEvent {
        CacheEvent::Updated {
            query_hash: query_hash.to_string(),
            status: self.state_tx.borrow().status,
        }
    }
}

pub(crate) struct ClientInner {
    config: CacheConfig,
    hooks: RwLock<Hooks>,
    entries: Mutex<HashMap<String, QueryEntry>>,
    listeners: Mutex<Vec<(ListenerId, CacheListener)>>,
    next_listener_id: AtomicU64,
    next_fetch_id: AtomicU64,
}

impl ClientInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, QueryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, CacheListener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_hash_fn(&self) -> Option<KeyHashFn> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .key_hash_fn
            .clone()
    }

    fn default_query_fn(&self) -> Option<QueryFn> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .default_query_fn
            .clone()
    }

    pub(crate) fn hash_key(&self, key: &QueryKey) -> String {
        match self.key_hash_fn() {
            Some(hash_fn) => hash_fn(key),
            None => canonical_json(&key.clone().into_value()),
        }
    }

    /// Deliver events to listeners. Must be called with no locks held.
    fn emit(&self, events: Vec<CacheEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<CacheListener> = self
            .listeners()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for event in &events {
            debug!(
                query_hash = %event.query_hash(),
                event = event.event_type(),
                "Cache event"
            );
            for listener in &listeners {
                listener(event);
            }
        }
    }

    fn ensure_entry<'a>(
        &self,
        entries: &'a mut HashMap<String, QueryEntry>,
        query_hash: &str,
        options: &QueryOptions,
        events: &mut Vec<CacheEvent>,
    ) -> &'a mut QueryEntry {
        let mut created = false;
        let entry = entries.entry(query_hash.to_string()).or_insert_with(|| {
            created = true;
            let state = match &options.initial_data {
                Some(data) => QueryState::with_data(data.clone()),
                None => QueryState::pending(),
            };
            QueryEntry::new(options.query_key.clone(), state, &self.config)
        });
        if created {
            events.push(CacheEvent::Added {
                query_hash: query_hash.to_string(),
                query_key: options.query_key.clone(),
            });
        }
        entry.apply(options);
        entry
    }

    fn remove_locked(
        entries: &mut HashMap<String, QueryEntry>,
        query_hash: &str,
        events: &mut Vec<CacheEvent>,
    ) {
        if let Some(entry) = entries.remove(query_hash) {
            events.push(CacheEvent::Removed {
                query_hash: query_hash.to_string(),
                query_key: entry.query_key,
            });
        }
    }

    /// Start a fetch for `entry`, or join the one already running.
    fn start_fetch(
        self: &Arc<Self>,
        query_hash: &str,
        entry: &mut QueryEntry,
        events: &mut Vec<CacheEvent>,
    ) -> SharedFetch {
        if let Some((_, fetch)) = &entry.in_flight {
            return fetch.clone();
        }

        let fetch_id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let query_fn = entry.query_fn.clone().or_else(|| self.default_query_fn());
        let context = QueryFnContext {
            query_key: entry.query_key.clone(),
            query_hash: query_hash.to_string(),
        };
        let retry = entry.retry;
        let started_at = entry.state_tx.borrow().data_update_count;
        let config = self.config.clone();
        let weak = Arc::downgrade(self);

        entry
            .state_tx
            .send_modify(|state| state.fetch_status = FetchStatus::Fetching);
        events.push(entry.updated_event(query_hash));

        let fetch = async move {
            let query_hash = context.query_hash.clone();
            let result = match query_fn {
                Some(query_fn) => run_query_fn(&query_fn, context, retry, &config).await,
                None => Err(FetchError::MissingQueryFn {
                    query_hash: query_hash.clone(),
                }),
            };
            if let Some(inner) = weak.upgrade() {
                inner.finish_fetch(&query_hash, fetch_id, started_at, &result);
            }
            result
        }
        .boxed()
        .shared();

        entry.in_flight = Some((fetch_id, fetch.clone()));
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(fetch.clone());
        }
        debug!(query_hash = %query_hash, fetch_id, "Fetch started");
        fetch
    }

    /// Start a fetch that nobody awaits. Without a runtime nothing would poll
    /// it, so the entry is left idle for the next awaited fetch.
    fn spawn_fetch(
        self: &Arc<Self>,
        query_hash: &str,
        entry: &mut QueryEntry,
        events: &mut Vec<CacheEvent>,
    ) {
        if Handle::try_current().is_err() {
            warn!(query_hash = %query_hash, "No runtime available, background fetch not started");
            return;
        }
        let _fetch = self.start_fetch(query_hash, entry, events);
    }

    fn finish_fetch(
        self: &Arc<Self>,
        query_hash: &str,
        fetch_id: u64,
        started_at: u64,
        result: &Result<Value, FetchError>,
    ) {
        let mut events = Vec::new();
        {
            let mut entries = self.entries();
            let Some(entry) = entries.get_mut(query_hash) else {
                return;
            };
            if !matches!(&entry.in_flight, Some((id, _)) if *id == fetch_id) {
                return;
            }
            entry.in_flight = None;
            entry.state_tx.send_modify(|state| {
                match result {
                    Ok(value) if state.data_update_count == started_at => {
                        state.write_data(value.clone());
                    }
                    Ok(_) => {
                        // Data was written while fetching; it is newer than the fetch result.
                        state.is_invalidated = false;
                    }
                    Err(error) => {
                        state.fetch_failure_count += 1;
                        state.write_error(error.clone());
                    }
                }
                state.fetch_status = FetchStatus::Idle;
            });
            events.push(entry.updated_event(query_hash));

            let expire_now = entry.observers == 0 && self.schedule_gc(query_hash, entry, true);
            if expire_now {
                Self::remove_locked(&mut entries, query_hash, &mut events);
            }
        }
        if let Err(error) = result {
            warn!(query_hash = %query_hash, error = %error, "Fetch failed");
        }
        self.emit(events);
    }

    /// Arrange for an unobserved entry to be collected after its gc time.
    ///
    /// Returns `true` when the entry should be removed right away. With
    /// `allow_immediate` unset a zero gc time still defers removal to a task,
    /// so no `Removed` event is emitted from inside the caller.
    fn schedule_gc(
        self: &Arc<Self>,
        query_hash: &str,
        entry: &mut QueryEntry,
        allow_immediate: bool,
    ) -> bool {
        entry.gc_epoch += 1;
        if entry.in_flight.is_some() {
            return false;
        }
        if entry.gc_time.is_zero() && allow_immediate {
            return true;
        }

        let epoch = entry.gc_epoch;
        let gc_time = entry.gc_time;
        match Handle::try_current() {
            Ok(handle) => {
                let weak = Arc::downgrade(self);
                let query_hash = query_hash.to_string();
                handle.spawn(async move {
                    tokio::time::sleep(gc_time).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.collect(&query_hash, epoch);
                    }
                });
            }
            Err(_) => {
                debug!(query_hash = %query_hash, "No runtime available, entry kept until removed");
            }
        }
        false
    }

    fn collect(&self, query_hash: &str, epoch: u64) {
        let mut events = Vec::new();
        {
            let mut entries = self.entries();
            let collectable = entries.get(query_hash).is_some_and(|entry| {
                entry.gc_epoch == epoch && entry.observers == 0 && entry.in_flight.is_none()
            });
            if collectable {
                Self::remove_locked(&mut entries, query_hash, &mut events);
            }
        }
        self.emit(events);
    }

    pub(crate) async fn fetch(
        self: &Arc<Self>,
        options: &QueryOptions,
        force: bool,
    ) -> Result<Value, FetchError> {
        let query_hash = self.hash_key(&options.query_key);
        let mut events = Vec::new();
        let fetch = {
            let mut entries = self.entries();
            let entry = self.ensure_entry(&mut entries, &query_hash, options, &mut events);
            match entry.fresh_data().filter(|_| !force) {
                Some(data) => {
                    let expire_now =
                        entry.observers == 0 && self.schedule_gc(&query_hash, entry, true);
                    if expire_now {
                        Self::remove_locked(&mut entries, &query_hash, &mut events);
                    }
                    Err(data)
                }
                None => Ok(self.start_fetch(&query_hash, entry, &mut events)),
            }
        };
        self.emit(events);

        match fetch {
            Ok(fetch) => {
                let value = fetch.await?;
                // Prefer data pushed while the fetch ran.
                Ok(self.data_for_hash(&query_hash).unwrap_or(value))
            }
            Err(fresh) => Ok(fresh),
        }
    }

    fn data_for_hash(&self, query_hash: &str) -> Option<Value> {
        self.entries()
            .get(query_hash)
            .and_then(|entry| entry.state_tx.borrow().data.clone())
    }

    pub(crate) fn add_observer(
        self: &Arc<Self>,
        query_hash: &str,
        options: &QueryOptions,
    ) -> watch::Receiver<QueryState> {
        let mut events = Vec::new();
        let receiver = {
            let mut entries = self.entries();
            let entry = self.ensure_entry(&mut entries, query_hash, options, &mut events);
            entry.observers += 1;
            if options.enabled {
                entry.enabled_observers += 1;
            }
            entry.gc_epoch += 1;
            events.push(CacheEvent::ObserverAdded {
                query_hash: query_hash.to_string(),
                observers: entry.observers,
            });
            if options.enabled && entry.fresh_data().is_none() {
                self.spawn_fetch(query_hash, entry, &mut events);
            }
            entry.state_tx.subscribe()
        };
        self.emit(events);
        receiver
    }

    pub(crate) fn remove_observer(self: &Arc<Self>, query_hash: &str, enabled: bool) {
        let mut events = Vec::new();
        {
            let mut entries = self.entries();
            let Some(entry) = entries.get_mut(query_hash) else {
                return;
            };
            entry.observers = entry.observers.saturating_sub(1);
            if enabled {
                entry.enabled_observers = entry.enabled_observers.saturating_sub(1);
            }
            events.push(CacheEvent::ObserverRemoved {
                query_hash: query_hash.to_string(),
                observers: entry.observers,
            });
            let expire_now = entry.observers == 0 && self.schedule_gc(query_hash, entry, true);
            if expire_now {
                Self::remove_locked(&mut entries, query_hash, &mut events);
            }
        }
        self.emit(events);
    }
}

async fn run_query_fn(
    query_fn: &QueryFn,
    context: QueryFnContext,
    retry: u32,
    config: &CacheConfig,
) -> Result<Value, FetchError> {
    let mut attempt = 0;
    loop {
        match query_fn(context.clone()).await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < retry && error.is_retryable() => {
                attempt += 1;
                let delay = config.retry_delay_for(attempt);
                warn!(
                    query_hash = %context.query_hash,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Query function failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

fn key_has_prefix(key: &QueryKey, prefix: &QueryKey) -> bool {
    key.parts().starts_with(prefix.parts())
}

/// A pull cache: query keys map to entries populated by fetch functions.
///
/// Cloning is cheap; clones share the same entries.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                hooks: RwLock::new(Hooks::default()),
                entries: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                next_fetch_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Whether two handles share the same entries.
    pub fn same_client(&self, other: &QueryClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Fetch a query, returning cached data while it is fresh.
    ///
    /// Concurrent fetches of the same key share one query function call.
    pub async fn fetch_query(&self, options: QueryOptions) -> Result<Value, FetchError> {
        self.inner.fetch(&options, false).await
    }

    /// Return cached data if any exists, fresh or not; fetch otherwise.
    pub async fn ensure_query_data(&self, options: QueryOptions) -> Result<Value, FetchError> {
        let query_hash = self.inner.hash_key(&options.query_key);
        if let Some(data) = self.inner.data_for_hash(&query_hash) {
            return Ok(data);
        }
        self.inner.fetch(&options, false).await
    }

    /// Attach an observer to a query.
    ///
    /// An enabled observer starts a fetch when the entry has no fresh data.
    /// Fetches are driven on the current tokio runtime.
    pub fn watch(&self, options: QueryOptions) -> QueryObserver {
        let query_hash = self.inner.hash_key(&options.query_key);
        let receiver = self.inner.add_observer(&query_hash, &options);
        QueryObserver::new(self.inner.clone(), query_hash, options, receiver)
    }

    pub fn mutation(&self, options: MutationOptions) -> MutationObserver {
        MutationObserver::new(options)
    }

    pub fn query_state(&self, key: &QueryKey) -> Option<QueryState> {
        let query_hash = self.inner.hash_key(key);
        self.inner
            .entries()
            .get(&query_hash)
            .map(|entry| entry.state_tx.borrow().clone())
    }

    /// Number of observers attached to the entry for `key`.
    pub fn observer_count(&self, key: &QueryKey) -> usize {
        let query_hash = self.inner.hash_key(key);
        self.inner
            .entries()
            .get(&query_hash)
            .map_or(0, |entry| entry.observers)
    }

    /// Mark every entry under `prefix` stale and refetch the observed ones.
    ///
    /// Returns the number of entries invalidated.
    pub fn invalidate_queries(&self, prefix: &QueryKey) -> usize {
        let mut events = Vec::new();
        let mut count = 0;
        {
            let mut entries = self.inner.entries();
            for (query_hash, entry) in entries.iter_mut() {
                if !key_has_prefix(&entry.query_key, prefix) {
                    continue;
                }
                count += 1;
                entry.state_tx.send_modify(|state| state.is_invalidated = true);
                events.push(entry.updated_event(query_hash));
                if entry.enabled_observers > 0 {
                    self.inner.spawn_fetch(query_hash, entry, &mut events);
                }
            }
        }
        self.inner.emit(events);
        debug!(invalidated = count, "Invalidated queries");
        count
    }

    /// Refetch every observed entry under `prefix`, waiting for completion.
    ///
    /// Failures land in the entries' error state. Returns the number of
    /// entries refetched.
    pub async fn refetch_queries(&self, prefix: &QueryKey) -> usize {
        let mut events = Vec::new();
        let fetches: Vec<SharedFetch> = {
            let mut entries = self.inner.entries();
            entries
                .iter_mut()
                .filter(|(_, entry)| {
                    entry.enabled_observers > 0 && key_has_prefix(&entry.query_key, prefix)
                })
                .map(|(query_hash, entry)| self.inner.start_fetch(query_hash, entry, &mut events))
                .collect()
        };
        self.inner.emit(events);
        let count = fetches.len();
        join_all(fetches).await;
        count
    }

    /// Remove every entry under `prefix`. Returns the number removed.
    pub fn remove_queries(&self, prefix: &QueryKey) -> usize {
        let mut events = Vec::new();
        {
            let mut entries = self.inner.entries();
            let doomed: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| key_has_prefix(&entry.query_key, prefix))
                .map(|(query_hash, _)| query_hash.clone())
                .collect();
            for query_hash in doomed {
                ClientInner::remove_locked(&mut entries, &query_hash, &mut events);
            }
        }
        let count = events.len();
        self.inner.emit(events);
        count
    }

    /// Remove every entry.
    pub fn clear(&self) -> usize {
        self.remove_queries(&QueryKey::default())
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.inner.entries();
        CacheStats {
            entries: entries.len(),
            observers: entries.values().map(|entry| entry.observers).sum(),
            fetching: entries
                .values()
                .filter(|entry| entry.in_flight.is_some())
                .count(),
            listeners: self.inner.listeners().len(),
        }
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PullCache for QueryClient {
    fn set_key_hash_fn(&self, hash_fn: KeyHashFn) {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .key_hash_fn = Some(hash_fn);
    }

    fn set_default_query_fn(&self, query_fn: QueryFn) {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .default_query_fn = Some(query_fn);
    }

    fn hash_key(&self, key: &QueryKey) -> String {
        self.inner.hash_key(key)
    }

    fn set_query_data(&self, key: &QueryKey, data: Value) {
        let query_hash = self.inner.hash_key(key);
        let mut events = Vec::new();
        {
            let mut entries = self.inner.entries();
            let options = QueryOptions::new(key.clone());
            let entry = self
                .inner
                .ensure_entry(&mut entries, &query_hash, &options, &mut events);
            entry.state_tx.send_modify(|state| state.write_data(data));
            events.push(entry.updated_event(&query_hash));

            let created = matches!(events.first(), Some(CacheEvent::Added { .. }));
            if created && entry.observers == 0 {
                // Writers may hold their own locks; never remove synchronously here.
                self.inner.schedule_gc(&query_hash, entry, false);
            }
        }
        self.inner.emit(events);
    }

    fn set_query_error(&self, key: &QueryKey, error: FetchError) {
        let query_hash = self.inner.hash_key(key);
        let mut events = Vec::new();
        {
            let mut entries = self.inner.entries();
            let Some(entry) = entries.get_mut(&query_hash) else {
                debug!(query_hash = %query_hash, "Error for unknown entry dropped");
                return;
            };
            entry.state_tx.send_modify(|state| state.write_error(error));
            events.push(entry.updated_event(&query_hash));
        }
        self.inner.emit(events);
    }

    fn query_data(&self, key: &QueryKey) -> Option<Value> {
        let query_hash = self.inner.hash_key(key);
        self.inner.data_for_hash(&query_hash)
    }

    fn subscribe_events(&self, listener: CacheListener) -> ListenerId {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners().push((id, listener));
        id
    }

    fn unsubscribe_events(&self, id: ListenerId) {
        self.inner.listeners().retain(|(existing, _)| *existing != id);
    }
}

// =============================================================================
// TESTS
// =============================================================================
