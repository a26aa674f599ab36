//! Query and mutation options, and client-wide configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use pushpull_core::{FetchError, QueryKey, Value};

/// Future returned by a query function.
pub type QueryFuture = BoxFuture<'static, Result<Value, FetchError>>;

/// Fetch function populating a cache entry on demand.
pub type QueryFn = Arc<dyn Fn(QueryFnContext) -> QueryFuture + Send + Sync>;

/// Global key hashing strategy.
pub type KeyHashFn = Arc<dyn Fn(&QueryKey) -> String + Send + Sync>;

/// Write function driven by a mutation observer.
pub type MutationFn = Arc<dyn Fn(Value) -> QueryFuture + Send + Sync>;

/// What a query function is told about the entry it is filling.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFnContext {
    pub query_key: QueryKey,
    pub query_hash: String,
}

/// How long fetched data stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleTime {
    /// Data becomes stale this long after it was written.
    After(Duration),
    /// Data is never stale; only invalidation triggers a refetch.
    Never,
}

impl StaleTime {
    pub fn is_stale(&self, age: Duration) -> bool {
        match self {
            StaleTime::After(limit) => age >= *limit,
            StaleTime::Never => false,
        }
    }
}

/// Descriptor of one query: `{query_key, query_fn, enabled}` plus tuning.
#[derive(Clone)]
pub struct QueryOptions {
    pub query_key: QueryKey,
    /// Per-query fetch function. Falls back to the client's default.
    pub query_fn: Option<QueryFn>,
    /// Disabled queries never fetch on their own.
    pub enabled: bool,
    pub stale_time: Option<StaleTime>,
    pub gc_time: Option<Duration>,
    pub retry: Option<u32>,
    /// Seed value used when the entry is created.
    pub initial_data: Option<Value>,
}

impl QueryOptions {
    pub fn new(query_key: QueryKey) -> Self {
        Self {
            query_key,
            query_fn: None,
            enabled: true,
            stale_time: None,
            gc_time: None,
            retry: None,
            initial_data: None,
        }
    }

    pub fn with_query_fn(mut self, query_fn: QueryFn) -> Self {
        self.query_fn = Some(query_fn);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_stale_time(mut self, stale_time: StaleTime) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_initial_data(mut self, data: Value) -> Self {
        self.initial_data = Some(data);
        self
    }
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("query_key", &self.query_key)
            .field("query_fn", &self.query_fn.as_ref().map(|_| "<fn>"))
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("retry", &self.retry)
            .field("initial_data", &self.initial_data)
            .finish()
    }
}

/// Descriptor of one mutation: `{mutation_fn}`.
#[derive(Clone)]
pub struct MutationOptions {
    pub mutation_fn: MutationFn,
}

impl MutationOptions {
    pub fn new(mutation_fn: MutationFn) -> Self {
        Self { mutation_fn }
    }
}

impl fmt::Debug for MutationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions").finish_non_exhaustive()
    }
}

/// Configuration for a `QueryClient`.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Stale time for queries that do not set their own.
    pub default_stale_time: StaleTime,
    /// How long an entry without observers is kept before removal.
    pub default_gc_time: Duration,
    /// Retries for a failing query function (retryable errors only).
    pub default_retry: u32,
    /// First retry delay; doubles per attempt up to `max_retry_delay`.
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_stale_time: StaleTime::After(Duration::ZERO),
            default_gc_time: Duration::from_secs(300), // 5 minutes
            default_retry: 3,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stale_time(mut self, stale_time: StaleTime) -> Self {
        self.default_stale_time = stale_time;
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.default_gc_time = gc_time;
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration, max: Duration) -> Self {
        self.retry_delay = delay;
        self.max_retry_delay = max;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}
