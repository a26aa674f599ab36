//! The push backend contract.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pushpull_core::{Args, BackendError, FunctionName, SubscriptionError, Value};

/// One delivery on a backend subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionUpdate {
    /// A fresh result of the subscribed query.
    Value(Value),
    /// The subscription failed. No further updates follow.
    Error(BackendError),
}

/// Callback a backend invokes for every update of one subscription.
///
/// Backends may call it synchronously from inside [`Backend::subscribe`].
pub type UpdateListener = Arc<dyn Fn(SubscriptionUpdate) + Send + Sync>;

/// An open backend subscription.
///
/// Unsubscribes when dropped, or explicitly via [`BackendSubscription::unsubscribe`].
pub struct BackendSubscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl BackendSubscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// A subscription with nothing to tear down.
    pub fn detached() -> Self {
        Self { unsubscribe: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for BackendSubscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for BackendSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSubscription")
            .field("open", &self.unsubscribe.is_some())
            .finish()
    }
}

/// A backend that pushes reactive query results and runs one-shot calls.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Open a live subscription to a query.
    ///
    /// `listener` receives every result in emission order until the returned
    /// subscription is dropped or an error is delivered.
    fn subscribe(
        &self,
        function: &FunctionName,
        args: &Args,
        listener: UpdateListener,
    ) -> Result<BackendSubscription, SubscriptionError>;

    /// Run an action once.
    async fn invoke_once(&self, function: &FunctionName, args: &Args)
        -> Result<Value, BackendError>;

    /// Run a mutation once.
    async fn invoke_write(&self, function: &FunctionName, args: &Args)
        -> Result<Value, BackendError>;
}
