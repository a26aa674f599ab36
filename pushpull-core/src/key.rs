//! Cache key codec.
//!
//! Turns a (kind, function, arguments-or-skip) triple into the ordered
//! [`QueryKey`] the pull cache stores entries under, and hashes query keys to
//! the comparison-stable strings the cache deduplicates by.
//!
//! # Key layout
//!
//! ```text
//! ["reactiveQuery", "messages:list", {"channel": "general"}]
//! ["action",        "weather:get",   {}]
//! ["reactiveQuery", "messages:count", "skip"]
//! ```
//!
//! # Hash layout
//!
//! ```text
//! reactiveQuery:<16 hex of sha256(function name)>:<64 hex of sha256(canonical key)>
//! ```
//!
//! The function-name digest namespaces every hash by identity, and the
//! canonical key is serialized with object keys sorted at every depth, so
//! argument key order never changes the hash.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::args::{Args, ArgsOrSkip, Skippable};
use crate::error::ArgumentShapeError;
use crate::function::FunctionName;

/// Key tag for reactive (subscribed) queries.
pub const REACTIVE_QUERY_TAG: &str = "reactiveQuery";
/// Key tag for one-shot actions.
pub const ACTION_TAG: &str = "action";
/// Encoding of the skip sentinel inside a key.
pub const SKIP_MARKER: &str = "skip";
/// Prefix of hashes for keys the bridge does not own.
pub const FOREIGN_HASH_PREFIX: &str = "q:";

/// Length of the function-name digest embedded in hashes.
const NAME_DIGEST_LEN: usize = 16;

/// Which fetch path a bridge key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryKind {
    ReactiveQuery,
    Action,
}

impl QueryKind {
    pub fn tag(&self) -> &'static str {
        match self {
            QueryKind::ReactiveQuery => REACTIVE_QUERY_TAG,
            QueryKind::Action => ACTION_TAG,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            REACTIVE_QUERY_TAG => Some(QueryKind::ReactiveQuery),
            ACTION_TAG => Some(QueryKind::Action),
            _ => None,
        }
    }
}

/// The pull cache's key type: an ordered sequence of JSON values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
    pub fn new(parts: Vec<Value>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_value(self) -> Value {
        Value::Array(self.0)
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        Self(parts)
    }
}

impl<const N: usize> From<[Value; N]> for QueryKey {
    fn from(parts: [Value; N]) -> Self {
        Self(parts.into())
    }
}

/// A decoded bridge key.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeKey {
    kind: QueryKind,
    function: FunctionName,
    args: ArgsOrSkip,
}

impl BridgeKey {
    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn function(&self) -> &FunctionName {
        &self.function
    }

    pub fn args(&self) -> &ArgsOrSkip {
        &self.args
    }

    /// Whether this key was built from the skip sentinel.
    pub fn is_skipped(&self) -> bool {
        self.args.is_skip()
    }

    pub fn to_query_key(&self) -> QueryKey {
        let args = match &self.args {
            ArgsOrSkip::Args(args) => args.clone().into_value(),
            ArgsOrSkip::Skip => Value::String(SKIP_MARKER.to_string()),
        };
        QueryKey(vec![
            Value::String(self.kind.tag().to_string()),
            Value::String(self.function.as_str().to_string()),
            args,
        ])
    }

    /// Recover a bridge key from a cache key.
    ///
    /// Returns `None` for keys that were not produced by the codec.
    pub fn parse(key: &QueryKey) -> Option<Self> {
        let [tag, name, args] = key.parts() else {
            return None;
        };
        let kind = QueryKind::from_tag(tag.as_str()?)?;
        let function = FunctionName::parse(name.as_str()?).ok()?;
        let args = match args {
            Value::Object(map) => ArgsOrSkip::Args(Args::from(map.clone())),
            Value::String(s) if s == SKIP_MARKER => ArgsOrSkip::Skip,
            _ => return None,
        };
        Some(Self {
            kind,
            function,
            args,
        })
    }

    /// Hash of this key, identical to `KeyCodec::hash(&self.to_query_key())`.
    pub fn hash(&self) -> String {
        KeyCodec::hash(&self.to_query_key())
    }
}

/// Builds and hashes cache keys.
pub struct KeyCodec;

impl KeyCodec {
    /// Build a key from untyped arguments.
    ///
    /// `Run(Value::Null)` stands for omitted arguments and becomes the empty
    /// record; any other non-object value is an argument-shape error.
    pub fn build_key(
        kind: QueryKind,
        function: &FunctionName,
        args: Skippable<Value>,
    ) -> Result<BridgeKey, ArgumentShapeError> {
        let args = match args {
            Skippable::Run(value) => ArgsOrSkip::Args(Args::from_value(value)?),
            Skippable::Skip => ArgsOrSkip::Skip,
        };
        Ok(BridgeKey {
            kind,
            function: function.clone(),
            args,
        })
    }

    /// Build a key from typed arguments.
    pub fn build_typed_key<A: Serialize>(
        kind: QueryKind,
        function: &FunctionName,
        args: Skippable<&A>,
    ) -> Result<BridgeKey, ArgumentShapeError> {
        Ok(BridgeKey {
            kind,
            function: function.clone(),
            args: ArgsOrSkip::from_skippable(args)?,
        })
    }

    /// Hash any cache key.
    ///
    /// Bridge keys are namespaced by kind and function identity; anything else
    /// falls back to its canonical JSON so the codec is safe to install as the
    /// cache's global hash function.
    pub fn hash(key: &QueryKey) -> String {
        match BridgeKey::parse(key) {
            Some(bridge_key) => {
                let canonical = canonical_json(&Value::Array(bridge_key.to_query_key().0));
                format!(
                    "{}:{}:{}",
                    bridge_key.kind.tag(),
                    name_digest(&bridge_key.function),
                    hex::encode(Sha256::digest(canonical.as_bytes()))
                )
            }
            None => format!(
                "{}{}",
                FOREIGN_HASH_PREFIX,
                canonical_json(&Value::Array(key.0.clone()))
            ),
        }
    }
}

fn name_digest(function: &FunctionName) -> String {
    let mut digest = hex::encode(Sha256::digest(function.as_str().as_bytes()));
    digest.truncate(NAME_DIGEST_LEN);
    digest
}

/// Serialize a JSON value with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
