//! Bridge controller.
//!
//! [`QueryBridge`] ties a push backend to one pull cache. `connect` installs
//! the key hash function and the default fetch function into the cache and
//! listens for entry removals so the backend subscription behind a removed
//! entry is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use futures_util::FutureExt;
use pushpull_cache::{
    CacheEvent, KeyHashFn, ListenerId, PullCache, QueryFn, QueryFnContext, QueryOptions,
    StaleTime,
};
use pushpull_core::{
    ActionRef, Args, ArgsOrSkip, BridgeConfig, BridgeError, BridgeKey, BridgeResult, FetchError,
    FunctionName, InvocationError, KeyCodec, MutationRef, NotConnectedError, QueryKey, QueryKind,
    QueryRef, Skippable, SubscriptionError, Value,
};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::backend::Backend;
use crate::mutation::{ActionHandle, MutationHandle};
use crate::query::{MaybeSkipped, QueryDescriptor, Resolvable};
use crate::registry::{RegistryHandle, SubscriptionRegistry, SubscriptionSink};

type FirstValue = oneshot::Sender<Result<Value, SubscriptionError>>;

/// Sink behind a held subscription: every push replaces the cache value.
///
/// The first delivery also resolves the fetch that opened the subscription;
/// a failure before that rejects the fetch instead of touching the cache.
struct CacheSink {
    cache: Arc<dyn PullCache>,
    query_key: QueryKey,
    first: Mutex<Option<FirstValue>>,
}

impl CacheSink {
    fn take_first(&self) -> Option<FirstValue> {
        self.first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl SubscriptionSink for CacheSink {
    fn on_value(&self, value: &Value) {
        if let Some(first) = self.take_first() {
            let _ = first.send(Ok(value.clone()));
        }
        self.cache.set_query_data(&self.query_key, value.clone());
    }

    fn on_error(&self, error: &SubscriptionError) {
        match self.take_first() {
            Some(first) => {
                let _ = first.send(Err(error.clone()));
            }
            None => self
                .cache
                .set_query_error(&self.query_key, FetchError::from(error.clone())),
        }
    }
}

/// Sink for a temporary reference taken to serve a refetch.
struct FirstValueSink {
    first: Mutex<Option<FirstValue>>,
}

impl FirstValueSink {
    fn send(&self, result: Result<Value, SubscriptionError>) {
        let first = self
            .first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(first) = first {
            let _ = first.send(result);
        }
    }
}

impl SubscriptionSink for FirstValueSink {
    fn on_value(&self, value: &Value) {
        self.send(Ok(value.clone()));
    }

    fn on_error(&self, error: &SubscriptionError) {
        self.send(Err(error.clone()));
    }
}

struct Connection {
    cache: Arc<dyn PullCache>,
    cache_addr: usize,
    listener_id: ListenerId,
    query_fn: QueryFn,
}

struct BridgeInner {
    backend: Arc<dyn Backend>,
    config: BridgeConfig,
    registry: SubscriptionRegistry,
    connection: RwLock<Option<Connection>>,
    /// Registry handles owned on behalf of cache entries, by query hash.
    held: Mutex<HashMap<String, RegistryHandle>>,
}

impl BridgeInner {
    fn held(&self) -> MutexGuard<'_, HashMap<String, RegistryHandle>> {
        self.held.lock().unwrap_or_else(|poisoned| {
            error!("Held subscription map lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn cache(&self) -> Option<Arc<dyn PullCache>> {
        self.connection
            .read()
            .ok()?
            .as_ref()
            .map(|connection| connection.cache.clone())
    }

    fn release_held(&self, query_hash: &str) {
        let handle = self.held().remove(query_hash);
        if let Some(handle) = handle {
            debug!(query_hash = %query_hash, "Cache entry removed, releasing subscription");
            self.registry.release(handle);
        }
    }

    async fn fetch(self: Arc<Self>, context: QueryFnContext) -> Result<Value, FetchError> {
        let Some(key) = BridgeKey::parse(&context.query_key) else {
            return Err(FetchError::ForeignKey {
                query_hash: context.query_hash,
            });
        };
        let args = match key.args() {
            ArgsOrSkip::Args(args) => args.clone(),
            ArgsOrSkip::Skip => {
                return Err(FetchError::Skipped {
                    query_hash: context.query_hash,
                })
            }
        };

        match key.kind() {
            QueryKind::ReactiveQuery => self.fetch_reactive(&context, key.function(), &args).await,
            QueryKind::Action => {
                debug!(function = %key.function(), "Running action for cache fetch");
                self.backend
                    .invoke_once(key.function(), &args)
                    .await
                    .map_err(|e| FetchError::from(InvocationError::from(e)))
            }
        }
    }

    async fn fetch_reactive(
        &self,
        context: &QueryFnContext,
        function: &FunctionName,
        args: &Args,
    ) -> Result<Value, FetchError> {
        let cache = self.cache().ok_or(FetchError::Disconnected)?;
        let query_hash = context.query_hash.as_str();
        let (tx, rx) = oneshot::channel();

        let live = self
            .held()
            .get(query_hash)
            .is_some_and(|handle| self.registry.is_current(handle));

        if live {
            // Serve the refetch from the live subscription with a temporary reference.
            let sink = Arc::new(FirstValueSink {
                first: Mutex::new(Some(tx)),
            });
            let handle = self.registry.acquire(query_hash, function, args, sink)?;
            let received = rx.await;
            self.registry.release(handle);
            debug!(query_hash = %query_hash, "Refetch served by live subscription");
            return first_value(received, query_hash);
        }

        let sink = Arc::new(CacheSink {
            cache,
            query_key: context.query_key.clone(),
            first: Mutex::new(Some(tx)),
        });
        let handle = self.registry.acquire(query_hash, function, args, sink)?;
        debug!(
            query_hash = %query_hash,
            function = %function,
            ref_count = self.registry.ref_count(query_hash),
            "Holding subscription for cache entry"
        );
        let displaced = self.held().insert(query_hash.to_string(), handle);
        if let Some(displaced) = displaced {
            self.registry.release(displaced);
        }
        first_value(rx.await, query_hash)
    }
}

fn first_value(
    received: Result<Result<Value, SubscriptionError>, oneshot::error::RecvError>,
    query_hash: &str,
) -> Result<Value, FetchError> {
    match received {
        Ok(result) => Ok(result?),
        Err(_) => Err(SubscriptionError::Released {
            query_hash: query_hash.to_string(),
        }
        .into()),
    }
}

/// Connects a push backend to a pull cache.
///
/// Cloning is cheap; clones share the same registry and connection.
#[derive(Clone)]
pub struct QueryBridge {
    inner: Arc<BridgeInner>,
}

impl QueryBridge {
    pub fn new<B: Backend>(backend: Arc<B>, config: BridgeConfig) -> BridgeResult<Self> {
        config.validate()?;
        let backend: Arc<dyn Backend> = backend;
        let registry = SubscriptionRegistry::new(backend.clone(), config.resubscribe.clone());
        Ok(Self {
            inner: Arc::new(BridgeInner {
                backend,
                config,
                registry,
                connection: RwLock::new(None),
                held: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Attach the bridge to `cache`.
    ///
    /// Connecting again to the same cache is a no-op; connecting to a
    /// different cache while connected fails with `AlreadyConnected`.
    pub fn connect<C: PullCache>(&self, cache: &Arc<C>) -> BridgeResult<()> {
        let cache_addr = Arc::as_ptr(cache) as *const () as usize;
        let mut connection = self
            .inner
            .connection
            .write()
            .map_err(|_| BridgeError::LockPoisoned)?;

        if let Some(existing) = connection.as_ref() {
            if existing.cache_addr == cache_addr {
                debug!("Query bridge already connected to this cache");
                return Ok(());
            }
            return Err(BridgeError::AlreadyConnected);
        }

        let cache: Arc<dyn PullCache> = cache.clone();
        let query_fn = self.query_fn();
        cache.set_key_hash_fn(self.hash_fn());
        cache.set_default_query_fn(query_fn.clone());

        let weak: Weak<BridgeInner> = Arc::downgrade(&self.inner);
        let listener_id = cache.subscribe_events(Arc::new(move |event: &CacheEvent| {
            if let CacheEvent::Removed { query_hash, .. } = event {
                if let Some(inner) = weak.upgrade() {
                    inner.release_held(query_hash);
                }
            }
        }));

        *connection = Some(Connection {
            cache,
            cache_addr,
            listener_id,
            query_fn,
        });
        info!("Query bridge connected");
        Ok(())
    }

    /// Detach from the cache and release every held subscription.
    pub fn disconnect(&self) -> BridgeResult<()> {
        let connection = self
            .inner
            .connection
            .write()
            .map_err(|_| BridgeError::LockPoisoned)?
            .take();
        let Some(connection) = connection else {
            return Ok(());
        };
        connection.cache.unsubscribe_events(connection.listener_id);

        let held: Vec<RegistryHandle> = self.inner.held().drain().map(|(_, h)| h).collect();
        let released = held.len();
        for handle in held {
            self.inner.registry.release(handle);
        }
        info!(released, "Query bridge disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .connection
            .read()
            .map(|connection| connection.is_some())
            .unwrap_or(false)
    }

    /// The key hash function installed by `connect`.
    pub fn hash_fn(&self) -> KeyHashFn {
        Arc::new(|key: &QueryKey| KeyCodec::hash(key))
    }

    /// The default fetch function installed by `connect`.
    ///
    /// Resolves reactive keys through the subscription registry and action
    /// keys with one backend call. Skipped and foreign keys are rejected.
    pub fn query_fn(&self) -> QueryFn {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |context: QueryFnContext| {
            let inner = weak.upgrade();
            async move {
                let inner = inner.ok_or(FetchError::Disconnected)?;
                inner.fetch(context).await
            }
            .boxed()
        })
    }

    /// Backend subscriptions currently open.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.registry.active_count()
    }

    /// Cache entries holding a subscription.
    pub fn held_queries(&self) -> usize {
        self.inner.held().len()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    fn connected_query_fn(&self) -> BridgeResult<QueryFn> {
        self.inner
            .connection
            .read()
            .map_err(|_| BridgeError::LockPoisoned)?
            .as_ref()
            .map(|connection| connection.query_fn.clone())
            .ok_or_else(|| NotConnectedError.into())
    }

    fn descriptor<A: Serialize, R, S>(
        &self,
        kind: QueryKind,
        function: &FunctionName,
        args: Skippable<&A>,
    ) -> BridgeResult<QueryDescriptor<R, S>> {
        let query_fn = self.connected_query_fn()?;
        let key = KeyCodec::build_typed_key(kind, function, args)?;
        let options = QueryOptions::new(key.to_query_key())
            .with_query_fn(query_fn)
            .enabled(!key.is_skipped());

        let options = match kind {
            QueryKind::ReactiveQuery => {
                let options = options.with_stale_time(StaleTime::Never);
                match self.inner.config.reactive_gc_time {
                    Some(gc_time) => options.with_gc_time(gc_time),
                    None => options,
                }
            }
            QueryKind::Action => match self.inner.config.action_stale_time {
                Some(stale_time) => options.with_stale_time(StaleTime::After(stale_time)),
                None => options,
            },
        };
        Ok(QueryDescriptor::new(key, options))
    }

    /// Descriptor for a reactive query. Never stale: updates arrive by push.
    pub fn reactive_query<A: Serialize, R>(
        &self,
        function: &QueryRef<A, R>,
        args: A,
    ) -> BridgeResult<QueryDescriptor<R>> {
        self.descriptor(QueryKind::ReactiveQuery, function.name(), Skippable::Run(&args))
    }

    /// Descriptor for a reactive query that is disabled when `args` is `Skip`.
    pub fn reactive_query_skippable<A: Serialize, R>(
        &self,
        function: &QueryRef<A, R>,
        args: Skippable<A>,
    ) -> BridgeResult<QueryDescriptor<R, MaybeSkipped>> {
        self.descriptor(QueryKind::ReactiveQuery, function.name(), args.as_ref())
    }

    /// Descriptor for a reactive query called with default arguments.
    pub fn reactive_query_default<A: Serialize + Default, R>(
        &self,
        function: &QueryRef<A, R>,
    ) -> BridgeResult<QueryDescriptor<R>> {
        self.reactive_query(function, A::default())
    }

    /// Descriptor for an action run once per cache-triggered fetch.
    pub fn action_query<A: Serialize, R>(
        &self,
        function: &ActionRef<A, R>,
        args: A,
    ) -> BridgeResult<QueryDescriptor<R>> {
        self.descriptor(QueryKind::Action, function.name(), Skippable::Run(&args))
    }

    pub fn action_query_skippable<A: Serialize, R>(
        &self,
        function: &ActionRef<A, R>,
        args: Skippable<A>,
    ) -> BridgeResult<QueryDescriptor<R, MaybeSkipped>> {
        self.descriptor(QueryKind::Action, function.name(), args.as_ref())
    }

    pub fn action_query_default<A: Serialize + Default, R>(
        &self,
        function: &ActionRef<A, R>,
    ) -> BridgeResult<QueryDescriptor<R, Resolvable>> {
        self.action_query(function, A::default())
    }

    pub fn mutation<A, R>(&self, function: &MutationRef<A, R>) -> MutationHandle<A, R> {
        MutationHandle::new(self.inner.backend.clone(), function.name().clone())
    }

    pub fn action<A, R>(&self, function: &ActionRef<A, R>) -> ActionHandle<A, R> {
        ActionHandle::new(self.inner.backend.clone(), function.name().clone())
    }
}

impl std::fmt::Debug for QueryBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBridge")
            .field("connected", &self.is_connected())
            .field("active_subscriptions", &self.active_subscriptions())
            .field("held_queries", &self.held_queries())
            .finish()
    }
}
