//! Pending-call table
//!
//! Per-remote map from request id to the resolver of the caller's
//! [`CallChain`](crate::CallChain). Every entry leaves the table exactly once,
//! through whichever of these happens first:
//!
//! - a matching Result or Error envelope ([`PendingCalls::resolve`])
//! - its timeout firing (settles with [`RpcError::TimedOut`])
//! - the remote closing ([`PendingCalls::reject_all`])
//!
//! Removal happens under the table lock, so a timeout racing a response can
//! never settle the same call twice. An id that is no longer in the table
//! (late or duplicate response) is ignored.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use birpc_common::{MethodName, RequestId, Result, RpcError};

use crate::chain::Resolver;

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

struct PendingCall {
    method: MethodName,
    timeout: Duration,
    resolver: Resolver<Value>,
    timer: Option<JoinHandle<()>>,
}

impl PendingCall {
    fn settle(self, outcome: Result<Value>) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        self.resolver.settle(outcome);
    }
}

type Table = HashMap<RequestId, PendingCall>;

/// In-flight calls of one remote.
///
/// Cloning is cheap: clones share the same table.
#[derive(Clone, Default)]
pub struct PendingCalls {
    calls: Arc<Mutex<Table>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores `resolver` under `id` and arms its timeout.
    ///
    /// Outside a tokio runtime the call cannot time out; this is logged.
    /// Registering an id that is still pending rejects the older call.
    pub fn register(
        &self,
        id: RequestId,
        method: &str,
        resolver: Resolver<Value>,
        timeout: Duration,
    ) {
        let mut calls = self.lock();

        // armed under the lock so a zero timeout still finds the entry
        let timer = match Handle::try_current() {
            Ok(handle) => {
                let table = Arc::downgrade(&self.calls);
                let timer_id = id.clone();
                Some(handle.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    expire(&table, &timer_id);
                }))
            }
            Err(_) => {
                warn!("No tokio runtime, call {} ({}) will not time out", id, method);
                None
            }
        };

        let call = PendingCall {
            method: method.to_string(),
            timeout,
            resolver,
            timer,
        };

        if let Some(previous) = calls.insert(id.clone(), call) {
            drop(calls);
            warn!("Request id {} reused while pending", id);
            previous.settle(Err(RpcError::Internal(format!(
                "request id {} was reused",
                id
            ))));
        }
    }

    /// Settles the call waiting on `id`.
    ///
    /// # Returns
    /// `false` if no call was waiting (late or duplicate response)
    pub fn resolve(&self, id: &RequestId, outcome: Result<Value>) -> bool {
        let call = self.lock().remove(id);
        match call {
            Some(call) => {
                debug!("Resolved {} ({})", id, call.method);
                call.settle(outcome);
                true
            }
            None => {
                debug!("No pending call for {}, dropping response", id);
                false
            }
        }
    }

    /// Rejects every pending call with `error`.
    ///
    /// # Returns
    /// The number of calls rejected
    pub fn reject_all(&self, error: RpcError) -> usize {
        let calls: Vec<PendingCall> = self.lock().drain().map(|(_, call)| call).collect();
        let count = calls.len();
        for call in calls {
            call.settle(Err(error.clone()));
        }
        count
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Timer body: evicts `id` if it is still pending.
fn expire(table: &Weak<Mutex<Table>>, id: &RequestId) {
    let Some(table) = table.upgrade() else {
        return;
    };
    let call = table
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(id);

    if let Some(call) = call {
        let after_ms = call.timeout.as_millis() as u64;
        warn!("Call {} ({}) timed out after {}ms", id, call.method, after_ms);
        // the timer is the running task, nothing to abort
        call.resolver.settle(Err(RpcError::TimedOut {
            method: call.method,
            after_ms,
        }));
    }
}
