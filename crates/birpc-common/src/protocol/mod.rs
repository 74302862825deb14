pub mod builtin;
pub mod error;
pub mod jsonrpc;
pub mod params;


pub use error::{Result, RpcError};
pub use jsonrpc::{decode_message, encode_batch, DecodeError, Decoded, Envelope, ErrorObject};
pub use params::{MethodName, Params, RequestId};
