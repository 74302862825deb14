//! Inbound call router
//!
//! Turns an inbound Request or Notification into a registry invocation and,
//! for requests, into the Result or Error envelope to send back. Responses
//! are not the router's business: they belong to the pending-call table of
//! the remote they arrived on.
//!
//! # Example
//!
//! ```
//! use birpc_common::{Envelope, Params};
//! use birpc_server::{Exposed, MethodRegistry, Router};
//! use serde_json::json;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let registry = MethodRegistry::new();
//! registry.register(&Exposed::new("Echo").method("echo", |p| p.arg::<String>(0)), None);
//!
//! let router = Router::new(registry);
//! let request = Envelope::request("Echo.echo", Params::new(vec![json!("hi")]), 1);
//! let reply = router.dispatch(request).await.unwrap();
//! assert_eq!(reply.encode(), r#"{"id":1,"jsonrpc":"2.0","result":"hi"}"#);
//! # });
//! ```

use birpc_common::Envelope;
use tracing::{debug, warn};

use crate::registry::MethodRegistry;

/// Dispatches inbound calls through a [`MethodRegistry`].
#[derive(Clone, Debug, Default)]
pub struct Router {
    registry: MethodRegistry,
}

impl Router {
    pub fn new(registry: MethodRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    /// Handles one inbound envelope.
    ///
    /// # Returns
    ///
    /// - `Some(Result|Error)` for a Request
    /// - `None` for a Notification, whatever its outcome (failures are logged)
    /// - `None` for responses, which are not routed here
    pub async fn dispatch(&self, envelope: Envelope) -> Option<Envelope> {
        match envelope {
            Envelope::Request { method, params, id } => {
                debug!("Dispatching {} (id {})", method, id);
                match self.registry.invoke(&method, params).await {
                    Ok(value) => Some(Envelope::result(id, value)),
                    Err(e) => {
                        debug!("{} failed: {}", method, e);
                        Some(Envelope::error(Some(id), e.to_error_object()))
                    }
                }
            }
            Envelope::Notification { method, params } => {
                debug!("Dispatching notification {}", method);
                if let Err(e) = self.registry.invoke(&method, params).await {
                    warn!("Notification {} failed: {}", method, e);
                }
                None
            }
            other => {
                debug!("Router ignoring response envelope {:?}", other.id());
                None
            }
        }
    }
}
