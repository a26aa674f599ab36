//! PUSHPULL Core - Function identities, arguments and cache keys
//!
//! Pure data structures and pure functions shared by every other crate:
//! backend function references, argument records with the skip sentinel,
//! the cache key codec, the error taxonomy and bridge configuration.

pub mod args;
pub mod config;
pub mod error;
pub mod function;
pub mod key;

pub use args::{Args, ArgsOrSkip, Skippable};
pub use config::{BridgeConfig, ResubscribePolicy};
pub use error::{
    ArgumentShapeError, BackendError, BridgeError, BridgeResult, ConfigError, FetchError,
    InvocationError, NotConnectedError, SubscriptionError,
};
pub use function::{
    Action, ActionRef, FunctionKind, FunctionName, FunctionRef, FunctionType,
    InvalidFunctionName, Mutation, MutationRef, Query, QueryRef,
};
pub use key::{canonical_json, BridgeKey, KeyCodec, QueryKey, QueryKind};

/// Re-exported so downstream crates agree on the value type.
pub use serde_json::Value;
