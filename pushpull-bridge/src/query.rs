//! Query descriptors.
//!
//! A descriptor is the cache-facing form of one backend call: its query key,
//! the bridge fetch function and whether it is enabled. Descriptors built
//! from [`Skippable`](pushpull_core::Skippable) arguments carry the
//! [`MaybeSkipped`] marker and cannot be handed to consumers that must
//! produce a value.

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use pushpull_cache::{QueryOptions, StaleTime};
use pushpull_core::{BridgeKey, FetchError, FunctionName, QueryKey, QueryKind, Value};
use serde::de::DeserializeOwned;

/// Marker for descriptors that always run.
#[derive(Debug)]
pub enum Resolvable {}

/// Marker for descriptors whose arguments may be `Skip`.
#[derive(Debug)]
pub enum MaybeSkipped {}

/// Cache descriptor for a reactive query or an action returning `R`.
pub struct QueryDescriptor<R, S = Resolvable> {
    key: BridgeKey,
    options: QueryOptions,
    _marker: PhantomData<fn() -> (R, S)>,
}

impl<R, S> QueryDescriptor<R, S> {
    pub(crate) fn new(key: BridgeKey, options: QueryOptions) -> Self {
        Self {
            key,
            options,
            _marker: PhantomData,
        }
    }

    pub fn query_key(&self) -> &QueryKey {
        &self.options.query_key
    }

    pub fn query_hash(&self) -> String {
        self.key.hash()
    }

    pub fn bridge_key(&self) -> &BridgeKey {
        &self.key
    }

    pub fn function(&self) -> &FunctionName {
        self.key.function()
    }

    pub fn kind(&self) -> QueryKind {
        self.key.kind()
    }

    /// `false` exactly when the arguments were `Skip`.
    pub fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn into_options(self) -> QueryOptions {
        self.options
    }

    /// Seed the cache entry with a value before the first fetch resolves.
    pub fn with_initial_data(mut self, data: Value) -> Self {
        self.options = self.options.with_initial_data(data);
        self
    }

    pub fn with_stale_time(mut self, stale_time: StaleTime) -> Self {
        self.options = self.options.with_stale_time(stale_time);
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.options = self.options.with_gc_time(gc_time);
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.options = self.options.with_retry(retry);
        self
    }
}

impl<R: DeserializeOwned, S> QueryDescriptor<R, S> {
    /// Decode a cached value into the declared return type.
    pub fn decode(&self, value: &Value) -> Result<R, FetchError> {
        serde_json::from_value(value.clone()).map_err(|e| FetchError::Decode {
            reason: format!("{}: {}", self.key.function(), e),
        })
    }
}

impl<R> QueryDescriptor<R, MaybeSkipped> {
    /// Narrow to a resolvable descriptor when the arguments were not `Skip`.
    pub fn into_resolvable(self) -> Option<QueryDescriptor<R, Resolvable>> {
        if self.key.is_skipped() {
            None
        } else {
            Some(QueryDescriptor::new(self.key, self.options))
        }
    }
}

impl<R, S> Clone for QueryDescriptor<R, S> {
    fn clone(&self) -> Self {
        Self::new(self.key.clone(), self.options.clone())
    }
}

impl<R, S> fmt::Debug for QueryDescriptor<R, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDescriptor")
            .field("key", &self.key)
            .field("options", &self.options)
            .finish()
    }
}
