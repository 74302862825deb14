//! birpc Client
//!
//! The calling side of a birpc connection:
//!
//! - [`CallChain`] - asynchronous result of every outbound call
//! - [`PendingCalls`] - in-flight calls of one remote, with timeouts
//! - [`Remote`] - one peer: lifecycle, discovery, call stubs

pub mod chain;
pub mod pending;
pub mod remote;

pub use chain::{CallChain, Resolver};
pub use pending::{PendingCalls, DEFAULT_CALL_TIMEOUT};
pub use remote::{Remote, RemoteConfig, RemoteId, RemoteMethod, RemoteState};
