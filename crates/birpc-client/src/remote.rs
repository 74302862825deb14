//! Remote: one peer connection
//!
//! A `Remote` is the calling side of a connection. It owns the outbound
//! transmitter, the table of in-flight calls, and one [`RemoteMethod`] stub
//! per method the peer has advertised.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting --discover()--> Discovering --method list--> Ready
//!      |                          |                         |
//!      +--------------------------+-------------------------+--> Closed
//! ```
//!
//! `Closed` is terminal. It is entered when the transport ends, when a
//! transmit fails, or on an explicit [`Remote::close`]; every pending call is
//! then rejected with [`RpcError::RemoteClosed`].
//!
//! Discovery only gates what can be *called*. Inbound requests are served in
//! every state but `Closed`. A failed discovery leaves the remote in
//! `Discovering` and is reported to [`Remote::wait_ready`]; a later
//! successful re-sync still makes it `Ready`.

use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use birpc_common::protocol::builtin::{parse_component_list, LIST_COMPONENTS};
use birpc_common::transport::Transmit;
use birpc_common::{Envelope, MethodName, Params, RequestId, Result, RpcError};

use crate::chain::CallChain;
use crate::pending::{PendingCalls, DEFAULT_CALL_TIMEOUT};

/// Stable identity of a remote, assigned locally at creation.
pub type RemoteId = Uuid;

/// Lifecycle state of a [`Remote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    /// Transport established, nothing exchanged yet
    Connecting,
    /// `system.listComponents` sent, waiting for the method list
    Discovering,
    /// Method list received, stubs available
    Ready,
    /// Transport gone, terminal
    Closed,
}

/// Per-remote settings.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Time a call may stay unanswered before it fails with `TimedOut`
    pub call_timeout: Duration,
}

impl RemoteConfig {
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Call stub for one method advertised by a peer.
///
/// Holds the remote weakly: a stub outliving its remote fails its calls with
/// `RemoteClosed`.
#[derive(Clone, Debug)]
pub struct RemoteMethod {
    remote: Weak<Remote>,
    name: MethodName,
}

impl RemoteMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Calls the method with positional arguments.
    pub fn call(&self, args: impl Into<Params>) -> CallChain {
        match self.remote.upgrade() {
            Some(remote) => remote.call(&self.name, args),
            None => CallChain::rejected(RpcError::RemoteClosed),
        }
    }

    /// Sends the method as a notification; no response is expected.
    pub fn notify(&self, args: impl Into<Params>) -> Result<()> {
        match self.remote.upgrade() {
            Some(remote) => remote.notify(&self.name, args),
            None => Err(RpcError::RemoteClosed),
        }
    }
}

/// One peer connection.
pub struct Remote {
    id: RemoteId,
    me: Weak<Remote>,
    transmitter: Box<dyn Transmit>,
    config: RemoteConfig,
    pending: PendingCalls,
    next_request: AtomicU64,
    stubs: RwLock<BTreeMap<MethodName, RemoteMethod>>,
    state: watch::Sender<RemoteState>,
    discovery_error: watch::Sender<Option<RpcError>>,
}

impl Remote {
    /// Creates a remote in the `Connecting` state.
    ///
    /// # Arguments
    /// * `transmitter` - Outbound half of the connection
    /// * `config` - Call timeout and other per-remote settings
    pub fn new(transmitter: impl Transmit, config: RemoteConfig) -> Arc<Self> {
        let (state, _) = watch::channel(RemoteState::Connecting);
        let (discovery_error, _) = watch::channel(None);
        Arc::new_cyclic(|me| Self {
            id: Uuid::new_v4(),
            me: me.clone(),
            transmitter: Box::new(transmitter),
            config,
            pending: PendingCalls::new(),
            next_request: AtomicU64::new(1),
            stubs: RwLock::new(BTreeMap::new()),
            state,
            discovery_error,
        })
    }

    pub fn id(&self) -> RemoteId {
        self.id
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn state(&self) -> RemoteState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == RemoteState::Closed
    }

    /// Why the last discovery of a not yet ready remote failed.
    pub fn discovery_error(&self) -> Option<RpcError> {
        self.discovery_error.borrow().clone()
    }

    /// Watches lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<RemoteState> {
        self.state.subscribe()
    }

    /// Number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    fn stubs(&self) -> RwLockReadGuard<'_, BTreeMap<MethodName, RemoteMethod>> {
        self.stubs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stubs_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<MethodName, RemoteMethod>> {
        self.stubs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Methods the peer has advertised so far.
    pub fn methods(&self) -> BTreeSet<MethodName> {
        self.stubs().keys().cloned().collect()
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.stubs().contains_key(method)
    }

    /// Stub for an advertised method.
    pub fn method(&self, method: &str) -> Option<RemoteMethod> {
        self.stubs().get(method).cloned()
    }

    /// Sends an envelope. A failed transmit closes the remote.
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::RemoteClosed);
        }
        self.transmitter.transmit(envelope.encode()).map_err(|e| {
            warn!("Transmit to remote {} failed: {}", self.id, e);
            self.close();
            e
        })
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_request.fetch_add(1, Ordering::Relaxed) as i64)
    }

    /// Calls `method` on the peer.
    ///
    /// The method does not have to be advertised: discovery only tells what
    /// the peer claims to expose. The returned chain settles with the peer's
    /// result, its error, a `TimedOut` after the configured timeout, or
    /// `RemoteClosed`.
    pub fn call(&self, method: &str, args: impl Into<Params>) -> CallChain {
        if self.is_closed() {
            return CallChain::rejected(RpcError::RemoteClosed);
        }

        let id = self.next_request_id();
        let (chain, resolver) = CallChain::pending();
        self.pending
            .register(id.clone(), method, resolver, self.config.call_timeout);

        debug!("Calling {} on remote {} (id {})", method, self.id, id);
        let request = Envelope::request(method, args.into(), id.clone());
        if let Err(e) = self.send(&request) {
            // no-op when the failure closed the remote, which rejected it already
            self.pending.resolve(&id, Err(e));
        }
        chain
    }

    /// Sends a notification to the peer.
    pub fn notify(&self, method: &str, args: impl Into<Params>) -> Result<()> {
        self.send(&Envelope::notification(method, args.into()))
    }

    /// Routes a Result or Error envelope to the call waiting on its id.
    ///
    /// # Returns
    /// `false` if nothing was waiting for it
    pub fn handle_response(&self, envelope: Envelope) -> bool {
        match envelope {
            Envelope::Result { id, value } => self.pending.resolve(&id, Ok(value)),
            Envelope::Error { id: Some(id), error } => {
                self.pending.resolve(&id, Err(error.into_error()))
            }
            Envelope::Error { id: None, error } => {
                warn!(
                    "Remote {} reported an uncorrelated error: {} (code {})",
                    self.id, error.message, error.code
                );
                false
            }
            other => {
                debug!("Not a response: {:?}", other);
                false
            }
        }
    }

    /// Runs discovery: asks the peer for its method list and merges it.
    ///
    /// From `Connecting` this moves the remote to `Discovering`, then to
    /// `Ready` once the list arrives. On a `Ready` remote it is a re-sync:
    /// new names are added, existing stubs are kept.
    ///
    /// If the remote is not ready yet, a failure is recorded and wakes
    /// [`wait_ready`](Self::wait_ready). The remote stays in `Discovering`.
    ///
    /// # Returns
    /// A chain yielding the names that were not known before
    pub fn discover(&self) -> CallChain<Vec<MethodName>> {
        self.state.send_if_modified(|state| {
            let connecting = *state == RemoteState::Connecting;
            if connecting {
                *state = RemoteState::Discovering;
            }
            connecting
        });
        self.discovery_error.send_if_modified(|error| error.take().is_some());

        let me = self.me.clone();
        let on_failure = self.me.clone();
        self.call(LIST_COMPONENTS, Params::empty())
            .then(move |listing: Value| match me.upgrade() {
                Some(remote) => Ok(remote.merge_methods(parse_component_list(&listing))),
                None => Err(RpcError::RemoteClosed),
            })
            .catch(move |error| {
                if let Some(remote) = on_failure.upgrade() {
                    remote.discovery_failed(&error);
                }
                Err(error)
            })
    }

    fn discovery_failed(&self, error: &RpcError) {
        if self.state() != RemoteState::Discovering {
            return;
        }
        debug!("Discovery of remote {} failed: {}", self.id, error);
        self.discovery_error.send_replace(Some(error.clone()));
    }

    /// Adds stubs for newly advertised names and marks the remote ready.
    fn merge_methods(&self, names: BTreeSet<MethodName>) -> Vec<MethodName> {
        if self.is_closed() {
            return Vec::new();
        }

        let mut added = Vec::new();
        {
            let mut stubs = self.stubs_mut();
            for name in names {
                if stubs.contains_key(&name) {
                    continue;
                }
                let stub = RemoteMethod {
                    remote: self.me.clone(),
                    name: name.clone(),
                };
                stubs.insert(name.clone(), stub);
                added.push(name);
            }
        }

        self.state.send_if_modified(|state| match state {
            RemoteState::Connecting | RemoteState::Discovering => {
                *state = RemoteState::Ready;
                true
            }
            _ => false,
        });
        self.discovery_error.send_if_modified(|error| error.take().is_some());

        info!(
            "Remote {} advertises {} methods ({} new)",
            self.id,
            self.stubs().len(),
            added.len()
        );
        added
    }

    /// Closes the remote.
    ///
    /// Rejects every pending call with `RemoteClosed` and drops the stubs.
    /// Idempotent.
    ///
    /// # Returns
    /// `true` if this call performed the transition
    pub fn close(&self) -> bool {
        let closed_now = self.state.send_if_modified(|state| {
            if *state == RemoteState::Closed {
                false
            } else {
                *state = RemoteState::Closed;
                true
            }
        });

        if closed_now {
            let rejected = self.pending.reject_all(RpcError::RemoteClosed);
            self.stubs_mut().clear();
            info!("Remote {} closed ({} pending calls rejected)", self.id, rejected);
        }
        closed_now
    }

    /// Waits until discovery completes.
    ///
    /// # Errors
    /// * `RemoteClosed` - the remote closes first
    /// * the discovery call's own error (peer error, `TimedOut`) if it fails
    pub async fn wait_ready(&self) -> Result<()> {
        let mut state = self.subscribe_state();
        let mut failure = self.discovery_error.subscribe();
        loop {
            match *state.borrow_and_update() {
                RemoteState::Ready => return Ok(()),
                RemoteState::Closed => return Err(RpcError::RemoteClosed),
                RemoteState::Connecting | RemoteState::Discovering => {}
            }
            let failed = failure.borrow_and_update().clone();
            if let Some(error) = failed {
                return Err(error);
            }

            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(RpcError::RemoteClosed);
                    }
                }
                changed = failure.changed() => {
                    if changed.is_err() {
                        return Err(RpcError::RemoteClosed);
                    }
                }
            }
        }
    }

    /// Waits until the remote is closed.
    pub async fn wait_closed(&self) {
        let mut state = self.subscribe_state();
        let _ = state.wait_for(|s| *s == RemoteState::Closed).await;
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("methods", &self.methods())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests;
