use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use super::error::{Result, RpcError};

/// Fully qualified method name, `Namespace.method`.
pub type MethodName = String;

/// Correlation id linking a Request to its Result or Error.
///
/// Locally issued requests always use [`RequestId::Number`] from a per-remote
/// counter; peers are free to use strings (UUIDs) and those are echoed back
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Reads an id from a raw JSON value. Only numbers and strings qualify.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => json!(n),
            RequestId::String(s) => json!(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<i32> for RequestId {
    fn from(n: i32) -> Self {
        RequestId::Number(n as i64)
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n as i64)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

/// Positional call arguments.
///
/// Both calling conventions seen on the wire (a bare array and an object with
/// an `args` array) are normalised into this one shape when an envelope is
/// decoded, so handlers only ever see positional arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Vec<Value>);

impl Params {
    pub fn new(args: Vec<Value>) -> Self {
        Params(args)
    }

    pub fn empty() -> Self {
        Params(Vec::new())
    }

    /// Normalises the `params` member of an inbound envelope.
    ///
    /// - missing or `null` -> no arguments
    /// - array -> positional arguments
    /// - object with an `args` array -> those arguments
    /// - object with any other `args` value -> that value as the single argument
    /// - any other object or scalar -> the value as the single argument
    pub fn from_wire(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Params::empty(),
            Some(Value::Array(items)) => Params(items.clone()),
            Some(Value::Object(map)) => match map.get("args") {
                Some(Value::Array(items)) => Params(items.clone()),
                Some(other) => Params(vec![other.clone()]),
                None => Params(vec![Value::Object(map.clone())]),
            },
            Some(other) => Params(vec![other.clone()]),
        }
    }

    /// Wire form: `{"args":[...]}`, or `[]` when there are no arguments.
    pub fn to_wire(&self) -> Value {
        if self.0.is_empty() {
            Value::Array(Vec::new())
        } else {
            json!({ "args": self.0 })
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Deserialises argument `index` into `T`.
    ///
    /// A missing argument is treated as `null`, so `Option<T>` parameters may
    /// be omitted by the caller.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self.0.get(index).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| {
            RpcError::InvalidParams(format!("argument {}: {}", index, e))
        })
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Params {
    fn from(args: Vec<Value>) -> Self {
        Params(args)
    }
}
