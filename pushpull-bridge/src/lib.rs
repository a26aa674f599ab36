//! PUSHPULL Bridge - Push subscriptions into a pull cache
//!
//! Reactive backend queries deliver results by push; the query cache fills
//! entries by pull. The bridge reconciles the two:
//!
//! - the key codec gives every (function, arguments) pair a stable cache key
//! - a reactive entry's fetch function subscribes once through the
//!   [`SubscriptionRegistry`] and every later push is written straight into
//!   the cache
//! - actions and mutations are one-shot calls under the same key framework
//!
//! ```ignore
//! let client = Arc::new(QueryClient::default());
//! let bridge = QueryBridge::new(backend, BridgeConfig::default())?;
//! bridge.connect(&client)?;
//!
//! let get_repo: QueryRef<RepoArgs, Repo> = QueryRef::parse("repos:get")?;
//! let mut repo = client.observe(bridge.reactive_query(&get_repo, args)?);
//! let first = repo.wait_for_data().await?;
//! ```

pub mod backend;
pub mod controller;
pub mod ext;
pub mod mutation;
pub mod query;
pub mod registry;

pub use backend::{Backend, BackendSubscription, SubscriptionUpdate, UpdateListener};
pub use controller::QueryBridge;
pub use ext::{QueryClientExt, TypedObserver};
pub use mutation::{ActionHandle, MutationHandle};
pub use query::{MaybeSkipped, QueryDescriptor, Resolvable};
pub use registry::{
    RegistryHandle, SharedSink, SubscriptionRegistry, SubscriptionSink, SubscriptionState,
};
