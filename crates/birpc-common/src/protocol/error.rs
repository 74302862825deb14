use serde_json::Value;
use thiserror::Error;

use super::jsonrpc::{
    ErrorObject, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
    SERVER_ERROR,
};

/// Every failure a birpc endpoint can observe.
///
/// The same type travels through a [`CallChain`](../../birpc_client/struct.CallChain.html)
/// error channel, so it is `Clone`: a settled outcome is handed to every
/// continuation registered on the chain.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid Request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// A registered handler reported a failure.
    #[error("{0}")]
    Handler(String),

    /// A handler panicked or the dispatch machinery failed.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Error envelope received from the peer.
    #[error("{message} (code {code})")]
    Remote {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Call to {method} timed out after {after_ms}ms")]
    TimedOut { method: String, after_ms: u64 },

    #[error("Remote closed")]
    RemoteClosed,

    #[error("More than one remote exposes {0}, use call_all to reach all of them")]
    AmbiguousTarget(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON serialization error: {0}")]
    Serialization(String),
}

impl RpcError {
    /// JSON-RPC error code used when this error is sent back to a peer.
    pub fn code(&self) -> i32 {
        match self {
            RpcError::Parse(_) => PARSE_ERROR,
            RpcError::InvalidRequest(_) => INVALID_REQUEST,
            RpcError::MethodNotFound(_) => METHOD_NOT_FOUND,
            RpcError::InvalidParams(_) => INVALID_PARAMS,
            RpcError::Internal(_) => INTERNAL_ERROR,
            RpcError::Remote { code, .. } => *code,
            RpcError::Handler(_)
            | RpcError::TimedOut { .. }
            | RpcError::RemoteClosed
            | RpcError::AmbiguousTarget(_)
            | RpcError::Transport(_)
            | RpcError::Serialization(_) => SERVER_ERROR,
        }
    }

    /// Converts the error into the object carried by an Error envelope.
    ///
    /// Errors that came from the peer keep their original code, message and
    /// data so they can be relayed unchanged.
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            RpcError::Remote {
                code,
                message,
                data,
            } => ErrorObject {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            RpcError::Handler(message) => ErrorObject::new(SERVER_ERROR, message.clone()),
            other => ErrorObject::new(other.code(), other.to_string()),
        }
    }

    /// Whether the failure was produced locally rather than reported by the peer.
    pub fn is_local(&self) -> bool {
        !matches!(self, RpcError::Remote { .. })
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RpcError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
