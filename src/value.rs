//! The cross-cutting `Value` tagged union (§3.1).

use serde::{Deserialize, Serialize};

/// Declared type tag, kept separate from the payload so that "declared
/// double, payload 0.0" can be distinguished from "unset" at call sites that
/// only have a [`ValueType`] (e.g. an `ArgSpec`'s declared type, or a
/// signal's capability entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Double,
    Int64,
    Uint64,
    Bool,
    String,
    Bytes,
}

impl ValueType {
    pub fn matches(self, value: &Value) -> bool {
        value.type_tag() == self
    }
}

/// The wire- and cache-level value union. Every typed interface in this
/// crate (signals, function args/returns) uses `Value` at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Double(f64),
    Int64(i64),
    Uint64(u64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn type_tag(&self) -> ValueType {
        match self {
            Value::Double(_) => ValueType::Double,
            Value::Int64(_) => ValueType::Int64,
            Value::Uint64(_) => ValueType::Uint64,
            Value::Bool(_) => ValueType::Bool,
            Value::String(_) => ValueType::String,
            Value::Bytes(_) => ValueType::Bytes,
        }
    }

    /// Coerce to `f64` for numeric BT ports (§4.7 `ReadSignal`, `GetParameter`).
    /// Strings and bytes have no numeric coercion and return `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Int64(v) => Some(*v as f64),
            Value::Uint64(v) => Some(*v as f64),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::String(_) | Value::Bytes(_) => None,
        }
    }

    /// Narrow, explicit numeric coercion used by the parameter manager
    /// (§4.4): `uint64 -> int64` is allowed only if it fits; integer-typed
    /// parameters reject floats outright.
    pub fn coerce_to(&self, target: ValueType) -> Option<Value> {
        if self.type_tag() == target {
            return Some(self.clone());
        }
        match (self, target) {
            (Value::Uint64(v), ValueType::Int64) => i64::try_from(*v).ok().map(Value::Int64),
            (Value::Int64(v), ValueType::Uint64) => u64::try_from(*v).ok().map(Value::Uint64),
            _ => None,
        }
    }

    /// Parses a JSON leaf value into a `Value`, used by the `CallDevice` BT
    /// node (§4.7) when decoding its `args` port. Returns `None` for JSON
    /// types with no `Value` counterpart (array, object, null).
    pub fn from_json(json: &serde_json::Value) -> Option<Value> {
        match json {
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::Int64(i))
                } else if let Some(u) = n.as_u64() {
                    Some(Value::Uint64(u))
                } else {
                    n.as_f64().map(Value::Double)
                }
            }
            serde_json::Value::String(s) => Some(Value::String(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) | serde_json::Value::Null => {
                None
            }
        }
    }
}
