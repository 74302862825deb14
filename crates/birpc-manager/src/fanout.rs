//! Fan-out dispatch across remotes
//!
//! A method name may be advertised by several remotes at once. [`call_all`]
//! reaches every one of them and gathers the outcomes per remote; [`call`]
//! and [`method`] are for the common case of exactly one provider and refuse
//! to guess when there are more.
//!
//! [`call_all`]: ConnectionManager::call_all
//! [`call`]: ConnectionManager::call
//! [`method`]: ConnectionManager::method

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use birpc_client::{CallChain, Remote, RemoteId, RemoteMethod, RemoteState};
use birpc_common::{Params, Result, RpcError};

use crate::manager::ConnectionManager;

/// Outcome of a fan-out call, one entry per targeted remote.
pub type FanOut = BTreeMap<RemoteId, Result<Value>>;

impl ConnectionManager {
    /// Ready remotes advertising `method`, in id order.
    pub fn targets(&self, method: &str) -> Vec<Arc<Remote>> {
        let mut targets: Vec<Arc<Remote>> = self
            .remote_list()
            .into_iter()
            .filter(|remote| remote.state() == RemoteState::Ready && remote.has_method(method))
            .collect();
        targets.sort_by_key(|remote| remote.id());
        targets
    }

    /// Calls `method` on every ready remote that advertises it.
    ///
    /// The chain resolves once every targeted call has settled, whether with a
    /// result, an error, a timeout or a closed remote. It never rejects: a
    /// failed call shows up as an `Err` entry under its remote. With no target
    /// the map is empty.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn demo(manager: birpc_manager::ConnectionManager) {
    /// let outcomes = manager
    ///     .call_all("Logger.flush", birpc_common::Params::empty())
    ///     .await
    ///     .unwrap();
    /// for (remote, outcome) in outcomes {
    ///     println!("{}: {:?}", remote, outcome);
    /// }
    /// # }
    /// ```
    pub fn call_all(&self, method: &str, args: impl Into<Params>) -> CallChain<FanOut> {
        let params = args.into();
        let targets = self.targets(method);
        debug!("Fanning out {} to {} remotes", method, targets.len());

        CallChain::all(
            targets
                .into_iter()
                .map(|remote| (remote.id(), remote.call(method, params.clone()))),
        )
    }

    /// Stub for `method` on the single remote that advertises it.
    ///
    /// # Errors
    /// * `MethodNotFound` - no ready remote advertises it
    /// * `AmbiguousTarget` - more than one does
    pub fn method(&self, method: &str) -> Result<RemoteMethod> {
        let mut targets = self.targets(method);
        if targets.len() > 1 {
            return Err(RpcError::AmbiguousTarget(method.to_string()));
        }
        targets
            .pop()
            .and_then(|remote| remote.method(method))
            .ok_or_else(|| RpcError::MethodNotFound(method.to_string()))
    }

    /// Calls `method` on the single remote that advertises it.
    ///
    /// Fails like [`method`](Self::method) when there is not exactly one.
    pub fn call(&self, method: &str, args: impl Into<Params>) -> CallChain {
        match self.method(method) {
            Ok(stub) => stub.call(args),
            Err(e) => CallChain::rejected(e),
        }
    }
}
