//! JSON-RPC 2.0 Envelope Codec
//!
//! Every message exchanged between two birpc endpoints is one of four
//! envelope kinds. Either side may send any of them.
//!
//! ```text
//! Request:      {"jsonrpc":"2.0","method":"<Class.fn>","params":{"args":[...]},"id":<id>}
//! Notification: {"jsonrpc":"2.0","method":"<Class.fn>","params":{"args":[...]}}
//! Result:       {"jsonrpc":"2.0","result":<value>,"id":<id>}
//! Error:        {"jsonrpc":"2.0","error":{"code":<int>,"message":"<text>"},"id":<id|null>}
//! ```
//!
//! A text frame may also carry a batch (a JSON array of envelopes); each
//! element is decoded independently and handled in array order.
//!
//! # Error Codes
//!
//! - `-32700`: Parse error
//! - `-32600`: Invalid Request
//! - `-32601`: Method not found
//! - `-32602`: Invalid params
//! - `-32603`: Internal error
//! - `-32000`: Application-defined handler error / ambiguous target
//!
//! # Example
//!
//! ```
//! use birpc_common::protocol::jsonrpc::Envelope;
//! use birpc_common::protocol::{Params, RequestId};
//! use serde_json::json;
//!
//! let request = Envelope::request("Calc.add", Params::new(vec![json!(2), json!(3)]), 1);
//! let text = request.encode();
//! assert_eq!(Envelope::decode(&text).unwrap(), request);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::error::RpcError;
use super::params::{MethodName, Params, RequestId};

/// JSON-RPC protocol version carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

// Standard JSON-RPC 2.0 error codes
/// Invalid JSON was received
pub const PARSE_ERROR: i32 = -32700;
/// The JSON sent is not a valid envelope
pub const INVALID_REQUEST: i32 = -32600;
/// The method does not exist / is not available
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Invalid method parameter(s)
pub const INVALID_PARAMS: i32 = -32602;
/// A handler raised or dispatch failed
pub const INTERNAL_ERROR: i32 = -32603;
/// Application-defined handler error
pub const SERVER_ERROR: i32 = -32000;

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    /// Error code (standard codes are negative integers)
    pub code: i32,
    /// Short description of the error
    pub message: String,
    /// Additional data (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Create a parse error (-32700)
    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    /// Create an invalid request error (-32600)
    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request")
    }

    /// Create a method not found error (-32601) naming the missing method
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    /// Turns an error received from a peer into a caller-visible error.
    pub fn into_error(self) -> RpcError {
        RpcError::Remote {
            code: self.code,
            message: self.message,
            data: self.data,
        }
    }
}

/// One JSON-RPC 2.0 message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A call expecting exactly one Result or Error with the same id.
    Request {
        method: MethodName,
        params: Params,
        id: RequestId,
    },
    /// A call with no id; nothing is sent back.
    Notification { method: MethodName, params: Params },
    /// Successful response.
    Result { id: RequestId, value: Value },
    /// Error response. `id` is `None` when the offending message had no
    /// recoverable id.
    Error {
        id: Option<RequestId>,
        error: ErrorObject,
    },
}

/// Failure to turn wire text into an [`Envelope`].
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{error}")]
pub struct DecodeError {
    /// `Parse` or `InvalidRequest`.
    pub error: RpcError,
    /// Id of the offending message, if one could be recovered.
    pub id: Option<RequestId>,
    /// Whether the element carried a `method` member. Only those are answered:
    /// the id of anything else may belong to our own id space.
    pub request: bool,
}

impl DecodeError {
    fn parse(message: impl Into<String>) -> Self {
        Self {
            error: RpcError::Parse(message.into()),
            id: None,
            request: false,
        }
    }

    fn invalid(message: impl Into<String>, id: Option<RequestId>) -> Self {
        Self {
            error: RpcError::InvalidRequest(message.into()),
            id,
            request: false,
        }
    }

    fn invalid_request(message: impl Into<String>, id: Option<RequestId>) -> Self {
        Self {
            request: true,
            ..Self::invalid(message, id)
        }
    }

    /// The Error envelope to send back, if the sender can correlate it.
    ///
    /// Malformed responses and unclassifiable elements are never answered.
    pub fn reply(&self) -> Option<Envelope> {
        if !self.request {
            return None;
        }
        self.id.as_ref().map(|id| Envelope::Error {
            id: Some(id.clone()),
            error: self.error.to_error_object(),
        })
    }
}

/// Outcome of decoding one element of an inbound message.
pub type Decoded = std::result::Result<Envelope, DecodeError>;

impl Envelope {
    pub fn request(method: impl Into<String>, params: Params, id: impl Into<RequestId>) -> Self {
        Envelope::Request {
            method: method.into(),
            params,
            id: id.into(),
        }
    }

    pub fn notification(method: impl Into<String>, params: Params) -> Self {
        Envelope::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn result(id: RequestId, value: Value) -> Self {
        Envelope::Result { id, value }
    }

    pub fn error(id: Option<RequestId>, error: ErrorObject) -> Self {
        Envelope::Error { id, error }
    }

    /// Id carried by the envelope (notifications have none).
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Envelope::Request { id, .. } | Envelope::Result { id, .. } => Some(id),
            Envelope::Error { id, .. } => id.as_ref(),
            Envelope::Notification { .. } => None,
        }
    }

    /// Whether this envelope answers a previously issued Request.
    pub fn is_response(&self) -> bool {
        matches!(self, Envelope::Result { .. } | Envelope::Error { .. })
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
        match self {
            Envelope::Request { method, params, id } => {
                obj.insert("method".into(), Value::String(method.clone()));
                obj.insert("params".into(), params.to_wire());
                obj.insert("id".into(), id.to_value());
            }
            Envelope::Notification { method, params } => {
                obj.insert("method".into(), Value::String(method.clone()));
                obj.insert("params".into(), params.to_wire());
            }
            Envelope::Result { id, value } => {
                obj.insert("result".into(), value.clone());
                obj.insert("id".into(), id.to_value());
            }
            Envelope::Error { id, error } => {
                // ErrorObject only holds plain JSON types
                let error = serde_json::to_value(error).unwrap_or(Value::Null);
                obj.insert("error".into(), error);
                obj.insert(
                    "id".into(),
                    id.as_ref().map(RequestId::to_value).unwrap_or(Value::Null),
                );
            }
        }
        Value::Object(obj)
    }

    /// Serialises the envelope to wire text.
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }

    /// Decodes a single envelope. Batches are rejected; use [`decode_message`].
    pub fn decode(text: &str) -> Decoded {
        let value: Value =
            serde_json::from_str(text).map_err(|e| DecodeError::parse(e.to_string()))?;
        if value.is_array() {
            return Err(DecodeError::invalid("unexpected batch", None));
        }
        Self::from_value(value)
    }

    /// Classifies an already parsed JSON value.
    pub fn from_value(value: Value) -> Decoded {
        let mut obj = match value {
            Value::Object(obj) => obj,
            _ => return Err(DecodeError::invalid("envelope must be an object", None)),
        };

        let raw_id = obj.remove("id").unwrap_or(Value::Null);
        let id = RequestId::from_value(&raw_id);

        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            let message = "missing jsonrpc \"2.0\"";
            return Err(if obj.contains_key("method") {
                DecodeError::invalid_request(message, id)
            } else {
                DecodeError::invalid(message, id)
            });
        }

        if let Some(method) = obj.remove("method") {
            let method = match method {
                Value::String(m) => m,
                _ => return Err(DecodeError::invalid_request("method must be a string", id)),
            };
            let params = Params::from_wire(obj.get("params"));
            return match (raw_id.is_null(), id) {
                (true, _) => Ok(Envelope::Notification { method, params }),
                (false, Some(id)) => Ok(Envelope::Request { method, params, id }),
                (false, None) => Err(DecodeError::invalid_request(
                    "id must be a string or an integer",
                    None,
                )),
            };
        }

        if let Some(value) = obj.remove("result") {
            return match id {
                Some(id) => Ok(Envelope::Result { id, value }),
                None => Err(DecodeError::invalid("result without id", None)),
            };
        }

        if let Some(error) = obj.remove("error") {
            let error: ErrorObject = serde_json::from_value(error)
                .map_err(|e| DecodeError::invalid(format!("malformed error object: {}", e), id.clone()))?;
            return Ok(Envelope::Error { id, error });
        }

        Err(DecodeError::invalid(
            "neither method nor result/error present",
            id,
        ))
    }
}

/// Decodes wire text that may hold a single envelope or a batch.
///
/// Text that is not JSON, and an empty batch, fail as a whole. Otherwise each
/// element yields its own [`Decoded`] outcome, in array order.
pub fn decode_message(text: &str) -> std::result::Result<Vec<Decoded>, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::parse(e.to_string()))?;
    match value {
        Value::Array(items) if items.is_empty() => {
            Err(DecodeError::invalid("empty batch", None))
        }
        Value::Array(items) => Ok(items.into_iter().map(Envelope::from_value).collect()),
        single => Ok(vec![Envelope::from_value(single)]),
    }
}

/// Serialises several envelopes as one batch.
pub fn encode_batch(envelopes: &[Envelope]) -> String {
    Value::Array(envelopes.iter().map(Envelope::to_value).collect()).to_string()
}
