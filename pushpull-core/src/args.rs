//! Argument records and the skip sentinel.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ArgumentShapeError;

/// A plain keyed argument record sent to a backend function.
///
/// Construction only succeeds from a JSON object (or `null`/unit, which mean
/// "no arguments" and become the empty record). Key order is irrelevant: the
/// key codec canonicalizes records before hashing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Args(Map<String, Value>);

impl Args {
    /// The empty record.
    pub fn empty() -> Self {
        Self(Map::new())
    }

    /// Build from an arbitrary JSON value.
    pub fn from_value(value: Value) -> Result<Self, ArgumentShapeError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::empty()),
            other => Err(ArgumentShapeError::NotARecord {
                found: json_type_name(&other).to_string(),
            }),
        }
    }

    /// Serialize a typed argument value into a record.
    pub fn from_serialize<A: Serialize + ?Sized>(args: &A) -> Result<Self, ArgumentShapeError> {
        let value = serde_json::to_value(args).map_err(|e| ArgumentShapeError::Unserializable {
            reason: e.to_string(),
        })?;
        Self::from_value(value)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Deserialize the record into a typed argument struct.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, ArgumentShapeError> {
        serde_json::from_value(Value::Object(self.0.clone())).map_err(|e| {
            ArgumentShapeError::Unserializable {
                reason: e.to_string(),
            }
        })
    }
}

impl From<Map<String, Value>> for Args {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Args {
    type Error = ArgumentShapeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

/// Typed arguments or the "do not run" sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skippable<A> {
    Run(A),
    Skip,
}

impl<A> Skippable<A> {
    pub fn is_skip(&self) -> bool {
        matches!(self, Skippable::Skip)
    }

    /// `Run(args)` when `condition` holds, otherwise `Skip`.
    pub fn when(condition: bool, args: A) -> Self {
        if condition {
            Skippable::Run(args)
        } else {
            Skippable::Skip
        }
    }

    /// `Run(args)` for `Some`, `Skip` for `None`.
    pub fn from_option(args: Option<A>) -> Self {
        match args {
            Some(args) => Skippable::Run(args),
            None => Skippable::Skip,
        }
    }

    pub fn as_ref(&self) -> Skippable<&A> {
        match self {
            Skippable::Run(args) => Skippable::Run(args),
            Skippable::Skip => Skippable::Skip,
        }
    }
}

impl<A> From<A> for Skippable<A> {
    fn from(args: A) -> Self {
        Skippable::Run(args)
    }
}

/// Untyped counterpart of [`Skippable`], as it appears inside a cache key.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgsOrSkip {
    Args(Args),
    Skip,
}

impl ArgsOrSkip {
    pub fn is_skip(&self) -> bool {
        matches!(self, ArgsOrSkip::Skip)
    }

    pub fn args(&self) -> Option<&Args> {
        match self {
            ArgsOrSkip::Args(args) => Some(args),
            ArgsOrSkip::Skip => None,
        }
    }

    /// Serialize typed skippable arguments.
    pub fn from_skippable<A: Serialize>(args: Skippable<&A>) -> Result<Self, ArgumentShapeError> {
        match args {
            Skippable::Run(args) => Args::from_serialize(args).map(ArgsOrSkip::Args),
            Skippable::Skip => Ok(ArgsOrSkip::Skip),
        }
    }
}

impl From<Args> for ArgsOrSkip {
    fn from(args: Args) -> Self {
        ArgsOrSkip::Args(args)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
