//! birpc Common Types and Transport
//!
//! This crate provides the wire protocol and transport plumbing shared by
//! every birpc component.
//!
//! # Overview
//!
//! birpc is a bidirectional JSON-RPC 2.0 engine: either end of a connection
//! can expose methods and call the methods the other end exposes. This crate
//! contains the pieces both roles need:
//!
//! - **Protocol Layer**: envelope codec, error taxonomy, positional params
//! - **Transport Layer**: the whole-message channel the engine runs over
//! - **Re-sync limiter**: spacing of repeated discovery against one peer
//!
//! # Architecture
//!
//! - **Transport**: any duplex channel delivering whole text messages (WebSocket adapter included)
//! - **Serialization**: JSON, one envelope or one batch per message
//! - **Correlation**: request ids are unique per remote while pending
//!
//! # Components
//!
//! - [`protocol`] - Envelopes, errors and params
//! - [`transport`] - `Transmit`, `MessageChannel` and the WebSocket adapter
//! - [`resync`] - Rate limiter for unsolicited re-discovery
//!
//! # Example
//!
//! ```
//! use birpc_common::{Envelope, Params, RequestId};
//! use serde_json::json;
//!
//! let request = Envelope::request("Calc.add", Params::new(vec![json!(2), json!(3)]), 1);
//! let text = request.encode();
//! assert_eq!(Envelope::decode(&text).unwrap(), request);
//!
//! let response = Envelope::result(RequestId::Number(1), json!(5));
//! assert!(response.is_response());
//! ```

pub mod protocol;
pub mod resync;
pub mod transport;

pub use protocol::*;
