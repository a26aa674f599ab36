//! Backend function identities.
//!
//! A [`FunctionName`] is the opaque, serializable handle naming one function
//! exposed by the backend. A [`FunctionRef`] pairs that name with the
//! function's kind and its statically declared argument and return shapes, so
//! calling a mutation as if it were a query, or passing the wrong argument
//! type, fails at compile time instead of at the backend.

use std::fmt;
use std::marker::PhantomData;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

static MODULE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_\-.]+(/[A-Za-z0-9_\-.]+)*$").expect("Invalid module path regex")
});

static EXPORT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid export name regex"));

/// Canonical name of a backend function: `path/to/module:export`.
///
/// Two names referring to the same function are equal and serialize to the
/// same string, whichever spelling they were parsed from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionName(String);

impl FunctionName {
    /// Parse and normalize a function name.
    ///
    /// - `messages:list` stays as is
    /// - `messages` becomes `messages:default`
    /// - `messages.js:list` / `messages.ts:list` drop the file extension
    pub fn parse(raw: &str) -> Result<Self, InvalidFunctionName> {
        let raw = raw.trim();
        let (module, export) = match raw.split_once(':') {
            Some((module, export)) => (module, export),
            None => (raw, "default"),
        };

        let module = module
            .strip_suffix(".js")
            .or_else(|| module.strip_suffix(".ts"))
            .unwrap_or(module);

        if module.is_empty() || !MODULE_PATH.is_match(module) {
            return Err(InvalidFunctionName {
                raw: raw.to_string(),
                reason: "module path must be '/'-separated segments of [A-Za-z0-9_-.]",
            });
        }
        if !EXPORT_NAME.is_match(export) {
            return Err(InvalidFunctionName {
                raw: raw.to_string(),
                reason: "export name must be an identifier",
            });
        }

        Ok(Self(format!("{}:{}", module, export)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The module path part (`path/to/module`).
    pub fn module(&self) -> &str {
        self.0.split_once(':').map(|(m, _)| m).unwrap_or(&self.0)
    }

    /// The export part (`list` in `messages:list`).
    pub fn export(&self) -> &str {
        self.0.split_once(':').map(|(_, e)| e).unwrap_or("default")
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for FunctionName {
    type Err = InvalidFunctionName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for FunctionName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for FunctionName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A function name that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid function name '{raw}': {reason}")]
pub struct InvalidFunctionName {
    pub raw: String,
    pub reason: &'static str,
}

/// Runtime discriminator of what a backend function does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctionType {
    /// Read operation that re-delivers whenever its data changes.
    Query,
    /// Read-like operation invoked once per call.
    Action,
    /// Write operation, never deduplicated.
    Mutation,
}

mod sealed {
    pub trait Sealed {}
}

/// Compile-time marker for a [`FunctionType`].
pub trait FunctionKind: sealed::Sealed + Send + Sync + 'static {
    const TYPE: FunctionType;
}

/// Marker for reactive queries.
#[derive(Debug, Clone, Copy)]
pub enum Query {}

/// Marker for actions.
#[derive(Debug, Clone, Copy)]
pub enum Action {}

/// Marker for mutations.
#[derive(Debug, Clone, Copy)]
pub enum Mutation {}

impl sealed::Sealed for Query {}
impl sealed::Sealed for Action {}
impl sealed::Sealed for Mutation {}

impl FunctionKind for Query {
    const TYPE: FunctionType = FunctionType::Query;
}

impl FunctionKind for Action {
    const TYPE: FunctionType = FunctionType::Action;
}

impl FunctionKind for Mutation {
    const TYPE: FunctionType = FunctionType::Mutation;
}

/// Typed reference to a backend function.
///
/// `A` is the argument record the function accepts and `R` the value it
/// returns. Equality and hashing only consider the name, so two references
/// naming the same function are interchangeable.
pub struct FunctionRef<K: FunctionKind, A, R> {
    name: FunctionName,
    _marker: PhantomData<fn(K, A) -> R>,
}

/// Reference to a reactive query.
pub type QueryRef<A, R> = FunctionRef<Query, A, R>;
/// Reference to an action.
pub type ActionRef<A, R> = FunctionRef<Action, A, R>;
/// Reference to a mutation.
pub type MutationRef<A, R> = FunctionRef<Mutation, A, R>;

impl<K: FunctionKind, A, R> FunctionRef<K, A, R> {
    pub fn new(name: FunctionName) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// Build a reference from a raw name such as `"messages:list"`.
    pub fn parse(raw: &str) -> Result<Self, InvalidFunctionName> {
        FunctionName::parse(raw).map(Self::new)
    }

    pub fn name(&self) -> &FunctionName {
        &self.name
    }

    pub fn function_type(&self) -> FunctionType {
        K::TYPE
    }
}

impl<K: FunctionKind, A, R> Clone for FunctionRef<K, A, R> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<K: FunctionKind, A, R> fmt::Debug for FunctionRef<K, A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRef")
            .field("type", &K::TYPE)
            .field("name", &self.name)
            .finish()
    }
}

impl<K: FunctionKind, A, R> PartialEq for FunctionRef<K, A, R> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<K: FunctionKind, A, R> Eq for FunctionRef<K, A, R> {}

impl<K: FunctionKind, A, R> std::hash::Hash for FunctionRef<K, A, R> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical_name() {
        let name = FunctionName::parse("messages:list").unwrap();
        assert_eq!(name.as_str(), "messages:list");
        assert_eq!(name.module(), "messages");
        assert_eq!(name.export(), "list");
    }

    #[test]
    fn test_parse_normalizes_default_export_and_extension() {
        let bare = FunctionName::parse("messages").unwrap();
        let explicit = FunctionName::parse("messages:default").unwrap();
        let with_ext = FunctionName::parse("messages.js:default").unwrap();
        assert_eq!(bare, explicit);
        assert_eq!(bare, with_ext);
        assert_eq!(bare.to_string(), "messages:default");
    }

    #[test]
    fn test_parse_nested_module() {
        let name = FunctionName::parse("admin/repos:star").unwrap();
        assert_eq!(name.module(), "admin/repos");
        assert_eq!(name.export(), "star");
    }

    #[test]
    fn test_parse_rejects_bad_names() {
        assert!(FunctionName::parse("").is_err());
        assert!(FunctionName::parse(":list").is_err());
        assert!(FunctionName::parse("messages:").is_err());
        assert!(FunctionName::parse("messages:1st").is_err());
        assert!(FunctionName::parse("a//b:c").is_err());
        assert!(FunctionName::parse("a b:c").is_err());
    }

    #[test]
    fn test_serde_roundtrip_uses_canonical_form() {
        let name = FunctionName::parse("repos.ts:get").unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"repos:get\"");
        let back: FunctionName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }

    #[test]
    fn test_function_ref_equality_ignores_spelling() {
        let a: QueryRef<(), u64> = FunctionRef::parse("messages:count").unwrap();
        let b: QueryRef<(), u64> = FunctionRef::parse("messages.ts:count").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.function_type(), FunctionType::Query);
    }

    #[test]
    fn test_function_type_markers() {
        let action: ActionRef<(), f64> = FunctionRef::parse("weather:get").unwrap();
        let mutation: MutationRef<(), ()> = FunctionRef::parse("repos:star").unwrap();
        assert_eq!(action.function_type(), FunctionType::Action);
        assert_eq!(mutation.function_type(), FunctionType::Mutation);
    }
}
