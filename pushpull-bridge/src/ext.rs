//! Typed consumption of descriptors through a `QueryClient`.

use std::marker::PhantomData;

use async_trait::async_trait;
use pushpull_cache::{QueryClient, QueryObserver, QueryState};
use pushpull_core::{FetchError, SubscriptionError};
use serde::de::DeserializeOwned;

use crate::query::{QueryDescriptor, Resolvable};

/// Descriptor-aware helpers on a query client.
#[async_trait]
pub trait QueryClientExt {
    /// Cached data if present, otherwise fetch it. Suspends until a value
    /// exists, so only descriptors that can never be skipped are accepted.
    async fn ensure_data<R>(&self, descriptor: QueryDescriptor<R, Resolvable>) -> Result<R, FetchError>
    where
        R: DeserializeOwned + Send + 'static;

    /// Fetch through the cache, honoring staleness.
    async fn fetch_data<R, S>(&self, descriptor: QueryDescriptor<R, S>) -> Result<R, FetchError>
    where
        R: DeserializeOwned + Send + 'static,
        S: 'static;

    /// Attach a typed observer.
    fn observe<R, S>(&self, descriptor: QueryDescriptor<R, S>) -> TypedObserver<R>;
}

#[async_trait]
impl QueryClientExt for QueryClient {
    async fn ensure_data<R>(&self, descriptor: QueryDescriptor<R, Resolvable>) -> Result<R, FetchError>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let value = self.ensure_query_data(descriptor.options().clone()).await?;
        descriptor.decode(&value)
    }

    async fn fetch_data<R, S>(&self, descriptor: QueryDescriptor<R, S>) -> Result<R, FetchError>
    where
        R: DeserializeOwned + Send + 'static,
        S: 'static,
    {
        let value = self.fetch_query(descriptor.options().clone()).await?;
        descriptor.decode(&value)
    }

    fn observe<R, S>(&self, descriptor: QueryDescriptor<R, S>) -> TypedObserver<R> {
        TypedObserver {
            observer: self.watch(descriptor.into_options()),
            _marker: PhantomData,
        }
    }
}

/// A [`QueryObserver`] that decodes its data as `R`.
pub struct TypedObserver<R> {
    observer: QueryObserver,
    _marker: PhantomData<fn() -> R>,
}

impl<R> TypedObserver<R> {
    pub fn observer(&self) -> &QueryObserver {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut QueryObserver {
        &mut self.observer
    }

    pub fn state(&self) -> QueryState {
        self.observer.state()
    }

    pub fn error(&self) -> Option<FetchError> {
        self.observer.state().error
    }

    pub fn is_enabled(&self) -> bool {
        self.observer.is_enabled()
    }
}

impl<R: DeserializeOwned> TypedObserver<R> {
    fn decode(&self, value: serde_json::Value) -> Result<R, FetchError> {
        serde_json::from_value(value).map_err(|e| FetchError::Decode {
            reason: e.to_string(),
        })
    }

    pub fn data(&self) -> Option<Result<R, FetchError>> {
        self.observer.data().map(|value| self.decode(value))
    }

    /// Wait until the entry settles with data or an error.
    pub async fn wait_for_data(&mut self) -> Result<R, FetchError> {
        let state = self
            .observer
            .wait_for(|state| state.is_success() || state.is_error())
            .await
            .ok_or_else(|| SubscriptionError::Released {
                query_hash: self.observer.query_hash().to_string(),
            })?;
        match (state.error, state.data) {
            (Some(error), _) => Err(error),
            (None, Some(value)) => self.decode(value),
            (None, None) => Err(FetchError::Decode {
                reason: "entry settled without data".to_string(),
            }),
        }
    }
}

impl<R> std::fmt::Debug for TypedObserver<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedObserver")
            .field("observer", &self.observer)
            .finish()
    }
}
