//! birpc Manager
//!
//! Ties the registry, remotes and transports together:
//!
//! - [`ConnectionManager`] - owns the remotes and routes their inbound messages
//! - fan-out - [`ConnectionManager::call_all`] and the single-target
//!   [`ConnectionManager::call`]
//!
//! # Example
//!
//! ```no_run
//! use birpc_common::transport::MessageChannel;
//! use birpc_manager::{ConnectionManager, ManagerConfig};
//! use birpc_server::Exposed;
//! use serde_json::json;
//!
//! # async fn demo() -> birpc_common::Result<()> {
//! let left = ConnectionManager::new(ManagerConfig::default());
//! let right = ConnectionManager::new(ManagerConfig::default());
//! right.register(
//!     &Exposed::new("Calc").method("add", |p| Ok(p.arg::<i64>(0)? + p.arg::<i64>(1)?)),
//!     None,
//! );
//!
//! let (a, b) = MessageChannel::pair();
//! let remote = left.serve(a);
//! right.serve(b);
//!
//! remote.wait_ready().await?;
//! let sum = left.call("Calc.add", vec![json!(2), json!(3)]).await?;
//! assert_eq!(sum, 5);
//! # Ok(())
//! # }
//! ```

pub mod fanout;
pub mod manager;

pub use fanout::FanOut;
pub use manager::{ConnectionManager, ManagerConfig, PeerEvent};
