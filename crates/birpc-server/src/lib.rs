//! birpc Server
//!
//! This crate provides the callee side of a birpc endpoint: the registry of
//! locally exposed methods and the router that answers inbound calls with it.

pub mod registry;
pub mod router;

pub use registry::{Exposed, Handler, HandlerFuture, MethodRegistry};
pub use router::Router;
