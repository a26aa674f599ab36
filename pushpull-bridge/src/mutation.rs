//! Mutation and action handles.
//!
//! Both perform exactly one backend call per invocation. Nothing is cached
//! or deduplicated, and backend errors reach the caller unchanged.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::FutureExt;
use pushpull_cache::MutationOptions;
use pushpull_core::{
    Args, BackendError, BridgeResult, FetchError, FunctionName, InvocationError, Value,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::backend::Backend;

#[derive(Clone, Copy)]
enum CallKind {
    Once,
    Write,
}

async fn invoke(
    backend: &dyn Backend,
    kind: CallKind,
    function: &FunctionName,
    args: &Args,
) -> Result<Value, BackendError> {
    let result = match kind {
        CallKind::Once => backend.invoke_once(function, args).await,
        CallKind::Write => backend.invoke_write(function, args).await,
    };
    if let Err(error) = &result {
        warn!(function = %function, error = %error, "Backend call rejected");
    }
    result
}

fn decode<R: DeserializeOwned>(function: &FunctionName, value: Value) -> Result<R, InvocationError> {
    serde_json::from_value(value).map_err(|e| InvocationError::Decode {
        function: function.to_string(),
        reason: e.to_string(),
    })
}

async fn invoke_variables(
    backend: Arc<dyn Backend>,
    kind: CallKind,
    function: FunctionName,
    variables: Value,
) -> Result<Value, FetchError> {
    let args = Args::from_value(variables)?;
    let value = invoke(backend.as_ref(), kind, &function, &args)
        .await
        .map_err(InvocationError::from)?;
    Ok(value)
}

fn options_for(backend: Arc<dyn Backend>, kind: CallKind, function: FunctionName) -> MutationOptions {
    MutationOptions::new(Arc::new(move |variables: Value| {
        invoke_variables(backend.clone(), kind, function.clone(), variables).boxed()
    }))
}

/// Imperative handle to a mutation returning `R`.
pub struct MutationHandle<A, R> {
    backend: Arc<dyn Backend>,
    function: FunctionName,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> MutationHandle<A, R> {
    pub(crate) fn new(backend: Arc<dyn Backend>, function: FunctionName) -> Self {
        Self {
            backend,
            function,
            _marker: PhantomData,
        }
    }

    pub fn function(&self) -> &FunctionName {
        &self.function
    }

    /// Run the mutation with untyped arguments.
    pub async fn call_raw(&self, args: &Args) -> Result<Value, InvocationError> {
        debug!(function = %self.function, "Running mutation");
        Ok(invoke(self.backend.as_ref(), CallKind::Write, &self.function, args).await?)
    }

    /// Cache-runner form, for use with `QueryClient::mutation`.
    pub fn into_options(self) -> MutationOptions {
        options_for(self.backend, CallKind::Write, self.function)
    }
}

impl<A: Serialize, R: DeserializeOwned> MutationHandle<A, R> {
    /// Run the mutation once.
    pub async fn call(&self, args: &A) -> BridgeResult<R> {
        let args = Args::from_serialize(args)?;
        let value = self.call_raw(&args).await?;
        Ok(decode(&self.function, value)?)
    }
}

impl<A, R> Clone for MutationHandle<A, R> {
    fn clone(&self) -> Self {
        Self::new(self.backend.clone(), self.function.clone())
    }
}

impl<A, R> fmt::Debug for MutationHandle<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationHandle")
            .field("function", &self.function)
            .finish()
    }
}

/// Imperative handle to an action returning `R`.
pub struct ActionHandle<A, R> {
    backend: Arc<dyn Backend>,
    function: FunctionName,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> ActionHandle<A, R> {
    pub(crate) fn new(backend: Arc<dyn Backend>, function: FunctionName) -> Self {
        Self {
            backend,
            function,
            _marker: PhantomData,
        }
    }

    pub fn function(&self) -> &FunctionName {
        &self.function
    }

    pub async fn call_raw(&self, args: &Args) -> Result<Value, InvocationError> {
        debug!(function = %self.function, "Running action");
        Ok(invoke(self.backend.as_ref(), CallKind::Once, &self.function, args).await?)
    }

    pub fn into_options(self) -> MutationOptions {
        options_for(self.backend, CallKind::Once, self.function)
    }
}

impl<A: Serialize, R: DeserializeOwned> ActionHandle<A, R> {
    /// Run the action once.
    pub async fn call(&self, args: &A) -> BridgeResult<R> {
        let args = Args::from_serialize(args)?;
        let value = self.call_raw(&args).await?;
        Ok(decode(&self.function, value)?)
    }
}

impl<A, R> Clone for ActionHandle<A, R> {
    fn clone(&self) -> Self {
        Self::new(self.backend.clone(), self.function.clone())
    }
}

impl<A, R> fmt::Debug for ActionHandle<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionHandle")
            .field("function", &self.function)
            .finish()
    }
}
