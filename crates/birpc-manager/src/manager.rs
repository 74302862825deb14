use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use birpc_client::{Remote, RemoteConfig, RemoteId, RemoteState, DEFAULT_CALL_TIMEOUT};
use birpc_common::protocol::builtin::ANNOUNCE;
use birpc_common::resync::{ResyncConfig, ResyncDecision, ResyncLimiter};
use birpc_common::transport::{MessageChannel, Transmit};
use birpc_common::{decode_message, DecodeError, Envelope, MethodName, Params};
use birpc_server::{Exposed, MethodRegistry, Router};

/// Configuration for a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Per-call timeout applied to every remote
    ///
    /// Default: 60s
    pub call_timeout: Duration,
    /// Minimum spacing of re-syncs triggered by a peer's announcements
    ///
    /// Default: 2s
    pub resync_interval: Duration,
    /// Capacity of the event channel returned by `subscribe`
    ///
    /// Default: 64
    pub event_capacity: usize,
}

impl ManagerConfig {
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_resync_interval(mut self, resync_interval: Duration) -> Self {
        self.resync_interval = resync_interval;
        self
    }

    pub fn with_event_capacity(mut self, event_capacity: usize) -> Self {
        self.event_capacity = event_capacity;
        self
    }

    /// Settings handed to each remote.
    pub fn remote_config(&self) -> RemoteConfig {
        RemoteConfig::default().with_call_timeout(self.call_timeout)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            resync_interval: Duration::from_secs(2),
            event_capacity: 64,
        }
    }
}

/// Lifecycle notifications published by a [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A remote was added; discovery has started
    RemoteUp(RemoteId),
    /// Discovery (or a re-sync) of a remote completed
    SetupDone {
        remote: RemoteId,
        /// Everything the remote advertises after the merge
        methods: Vec<MethodName>,
    },
    /// A remote closed and was removed
    RemoteDisconnected(RemoteId),
}

pub(crate) struct Shared {
    config: ManagerConfig,
    router: Router,
    pub(crate) remotes: RwLock<HashMap<RemoteId, Arc<Remote>>>,
    resync: ResyncLimiter<RemoteId>,
    events: broadcast::Sender<PeerEvent>,
}

/// Connection Manager - owns the remotes, the registry and the call surface.
///
/// A manager is symmetric: every remote it holds can call the methods
/// registered here, and everything the remotes advertise can be called from
/// here. There is no client/server distinction above the transport.
///
/// # Inbound routing
///
/// Each inbound message is decoded (batches element by element, in order):
///
/// 1. **Responses** resolve the matching pending call of the remote they came from
/// 2. **`system.announce`** triggers a rate-limited re-sync of that remote
/// 3. **Requests and notifications** are dispatched through the registry on a
///    spawned task, so a slow handler never holds up the next message
/// 4. **Undecodable input** is answered with an error when an id is
///    recoverable, otherwise logged and dropped
///
/// Cloning is cheap: clones share the same state.
///
/// All methods that add remotes or route messages spawn tasks and must run
/// inside a tokio runtime.
#[derive(Clone)]
pub struct ConnectionManager {
    pub(crate) shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Creates a manager with an empty registry.
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_registry(MethodRegistry::new(), config)
    }

    /// Creates a manager serving an existing registry.
    ///
    /// # Arguments
    /// * `registry` - Locally exposed methods (shared with any other clone)
    /// * `config` - Manager configuration
    pub fn with_registry(registry: MethodRegistry, config: ManagerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let resync = ResyncLimiter::new(ResyncConfig::new(config.resync_interval));

        Self {
            shared: Arc::new(Shared {
                router: Router::new(registry),
                remotes: RwLock::new(HashMap::new()),
                resync,
                events,
                config,
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &MethodRegistry {
        self.shared.router.registry()
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.shared.events.subscribe()
    }

    fn emit(&self, event: PeerEvent) {
        // no subscribers is fine
        let _ = self.shared.events.send(event);
    }

    fn remotes(&self) -> RwLockReadGuard<'_, HashMap<RemoteId, Arc<Remote>>> {
        self.shared
            .remotes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remotes_mut(&self) -> RwLockWriteGuard<'_, HashMap<RemoteId, Arc<Remote>>> {
        self.shared
            .remotes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a component and announces it to every connected remote.
    ///
    /// # Arguments
    /// * `exposed` - The component's capability table
    /// * `namespace` - Explicit namespace, or `None` for its type name
    ///
    /// # Returns
    /// The newly registered names. Nothing is announced if there are none.
    pub fn register(&self, exposed: &Exposed, namespace: Option<&str>) -> Vec<MethodName> {
        let added = self.registry().register(exposed, namespace);
        if !added.is_empty() {
            self.announce();
        }
        added
    }

    /// Tells every remote that our component set changed.
    pub fn announce(&self) {
        for remote in self.remote_list() {
            debug!("Announcing components to remote {}", remote.id());
            if let Err(e) = remote.notify(ANNOUNCE, Params::empty()) {
                debug!("Announce to {} failed: {}", remote.id(), e);
            }
        }
    }

    /// Adds a remote reachable through `transmitter` and starts discovery.
    ///
    /// The caller feeds its inbound messages to [`receive`](Self::receive) and
    /// calls [`remove_remote`](Self::remove_remote) when the transport ends.
    /// [`serve`](Self::serve) does both.
    pub fn add_remote(&self, transmitter: impl Transmit) -> Arc<Remote> {
        let remote = Remote::new(transmitter, self.shared.config.remote_config());
        let id = remote.id();

        self.remotes_mut().insert(id, remote.clone());
        info!("Remote {} up", id);
        self.emit(PeerEvent::RemoteUp(id));

        self.watch_close(&remote);
        self.start_discovery(remote.clone());
        remote
    }

    /// Removes the remote once it reports `Closed`, whatever closed it.
    fn watch_close(&self, remote: &Arc<Remote>) {
        let id = remote.id();
        let mut state = remote.subscribe_state();
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let _ = state.wait_for(|s| *s == RemoteState::Closed).await;
            if let Some(shared) = shared.upgrade() {
                ConnectionManager { shared }.forget(id);
            }
        });
    }

    fn start_discovery(&self, remote: Arc<Remote>) {
        let manager = self.clone();
        let discovery = remote.discover();
        tokio::spawn(async move {
            match discovery.await {
                Ok(added) => {
                    debug!("Discovery of {} added {:?}", remote.id(), added);
                    manager.emit(PeerEvent::SetupDone {
                        remote: remote.id(),
                        methods: remote.methods().into_iter().collect(),
                    });
                }
                Err(e) => warn!("Discovery of remote {} failed: {}", remote.id(), e),
            }
        });
    }

    /// Re-runs discovery on `remote`, spaced by the configured interval.
    fn schedule_resync(&self, remote: &Arc<Remote>) {
        let id = remote.id();
        match self.shared.resync.check(&id) {
            ResyncDecision::Now => {
                debug!("Re-syncing remote {}", id);
                self.start_discovery(remote.clone());
            }
            ResyncDecision::Deferred { retry_after } => {
                debug!("Re-sync of remote {} deferred by {:?}", id, retry_after);
                let manager = self.clone();
                let remote = remote.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(retry_after).await;
                    manager.shared.resync.complete_deferred(&id);
                    if !remote.is_closed() {
                        manager.start_discovery(remote);
                    }
                });
            }
            ResyncDecision::Coalesced => {
                debug!("Re-sync of remote {} already scheduled", id);
            }
        }
    }

    /// Routes one inbound message from `remote_id`.
    pub fn receive(&self, remote_id: RemoteId, text: &str) {
        let Some(remote) = self.remote(remote_id) else {
            debug!("Dropping message for unknown remote {}", remote_id);
            return;
        };

        let items = match decode_message(text) {
            Ok(items) => items,
            Err(e) => return self.reject_undecodable(&remote, e),
        };

        for item in items {
            match item {
                Ok(envelope) if envelope.is_response() => {
                    remote.handle_response(envelope);
                }
                Ok(Envelope::Notification { method, .. }) if method == ANNOUNCE => {
                    self.schedule_resync(&remote);
                }
                Ok(envelope) => self.dispatch(&remote, envelope),
                Err(e) => self.reject_undecodable(&remote, e),
            }
        }
    }

    fn dispatch(&self, remote: &Arc<Remote>, envelope: Envelope) {
        let router = self.shared.router.clone();
        let remote = remote.clone();
        tokio::spawn(async move {
            if let Some(reply) = router.dispatch(envelope).await {
                if let Err(e) = remote.send(&reply) {
                    debug!("Could not answer remote {}: {}", remote.id(), e);
                }
            }
        });
    }

    fn reject_undecodable(&self, remote: &Remote, error: DecodeError) {
        match error.reply() {
            Some(reply) => {
                warn!("Rejecting message from remote {}: {}", remote.id(), error);
                let _ = remote.send(&reply);
            }
            None => warn!("Dropping undecodable message from remote {}: {}", remote.id(), error),
        }
    }

    /// Serves a whole-message channel until it ends.
    ///
    /// Adds the remote, pumps its inbound messages into
    /// [`receive`](Self::receive) on a spawned task, and removes the remote
    /// when the channel ends or the remote closes.
    pub fn serve(&self, channel: MessageChannel) -> Arc<Remote> {
        let MessageChannel {
            outbound,
            mut inbound,
        } = channel;
        let remote = self.add_remote(outbound);
        let id = remote.id();

        let manager = self.clone();
        let watched = remote.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = inbound.recv() => match message {
                        Some(text) => manager.receive(id, &text),
                        None => break,
                    },
                    _ = watched.wait_closed() => break,
                }
            }
            debug!("Stopped reading from remote {}", id);
            manager.remove_remote(id);
        });

        remote
    }

    /// Closes and removes a remote.
    ///
    /// # Returns
    /// `false` if the remote was not known
    pub fn remove_remote(&self, id: RemoteId) -> bool {
        let remote = self.remote(id);
        if let Some(remote) = &remote {
            remote.close();
        }
        self.forget(id);
        remote.is_some()
    }

    fn forget(&self, id: RemoteId) {
        let removed = self.remotes_mut().remove(&id);
        if let Some(remote) = removed {
            remote.close();
            self.shared.resync.forget(&id);
            info!("Remote {} disconnected", id);
            self.emit(PeerEvent::RemoteDisconnected(id));
        }
    }

    pub fn remote(&self, id: RemoteId) -> Option<Arc<Remote>> {
        self.remotes().get(&id).cloned()
    }

    pub fn remote_ids(&self) -> Vec<RemoteId> {
        self.remotes().keys().copied().collect()
    }

    pub(crate) fn remote_list(&self) -> Vec<Arc<Remote>> {
        self.remotes().values().cloned().collect()
    }

    /// Every advertised method and the remotes advertising it.
    pub fn remote_methods(&self) -> BTreeMap<MethodName, Vec<RemoteId>> {
        let mut methods: BTreeMap<MethodName, Vec<RemoteId>> = BTreeMap::new();
        for remote in self.remote_list() {
            for name in remote.methods() {
                methods.entry(name).or_default().push(remote.id());
            }
        }
        for owners in methods.values_mut() {
            owners.sort();
        }
        methods
    }

    /// Invokes a local method directly, bypassing the transport.
    pub async fn invoke_local(&self, method: &str, args: impl Into<Params>) -> birpc_common::Result<Value> {
        self.registry().invoke(method, args.into()).await
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("remotes", &self.remote_ids())
            .field("registry", self.registry())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use birpc_common::protocol::builtin::LIST_COMPONENTS;
    use birpc_common::RequestId;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn manager() -> ConnectionManager {
        let manager = ConnectionManager::new(
            ManagerConfig::default().with_resync_interval(Duration::from_millis(100)),
        );
        manager.register(
            &Exposed::new("Calc").method("add", |p| Ok(p.arg::<i64>(0)? + p.arg::<i64>(1)?)),
            None,
        );
        manager
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("nothing sent")
            .expect("transport closed");
        serde_json::from_str(&text).unwrap()
    }

    async fn nothing_sent(rx: &mut mpsc::UnboundedReceiver<String>) -> bool {
        tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err()
    }

    /// Adds a remote and swallows its discovery request.
    async fn connected(manager: &ConnectionManager) -> (Arc<Remote>, mpsc::UnboundedReceiver<String>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let remote = manager.add_remote(tx);
        let discovery = recv(&mut rx).await;
        assert_eq!(discovery["method"], json!(LIST_COMPONENTS));
        (remote, rx)
    }

    #[test]
    fn test_manager_config_default() {
        let config = ManagerConfig::default();
        assert_eq!(config.call_timeout, Duration::from_secs(60));
        assert_eq!(config.resync_interval, Duration::from_secs(2));
        assert_eq!(config.event_capacity, 64);
    }

    #[test]
    fn test_manager_config_builders() {
        let config = ManagerConfig::default()
            .with_call_timeout(Duration::from_millis(5))
            .with_resync_interval(Duration::ZERO)
            .with_event_capacity(8);
        assert_eq!(config.remote_config().call_timeout, Duration::from_millis(5));
        assert_eq!(config.resync_interval, Duration::ZERO);
        assert_eq!(config.event_capacity, 8);
    }

    #[tokio::test]
    async fn test_add_remote_emits_event_and_discovers() {
        let manager = manager();
        let mut events = manager.subscribe();
        let (remote, _rx) = connected(&manager).await;

        assert_eq!(events.recv().await.unwrap(), PeerEvent::RemoteUp(remote.id()));
        assert_eq!(remote.state(), RemoteState::Discovering);
        assert_eq!(manager.remote_ids(), vec![remote.id()]);
    }

    #[tokio::test]
    async fn test_discovery_reply_marks_ready() {
        let manager = manager();
        let mut events = manager.subscribe();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let remote = manager.add_remote(tx);
        let discovery = recv(&mut rx).await;

        let reply = json!({"jsonrpc": "2.0", "result": {"Log.write": true}, "id": discovery["id"]});
        manager.receive(remote.id(), &reply.to_string());
        remote.wait_ready().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), PeerEvent::RemoteUp(remote.id()));
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::SetupDone {
                remote: remote.id(),
                methods: vec!["Log.write".to_string()]
            }
        );
        assert_eq!(
            manager.remote_methods().get("Log.write"),
            Some(&vec![remote.id()])
        );
    }

    #[tokio::test]
    async fn test_inbound_request_is_answered() {
        let manager = manager();
        let (remote, mut rx) = connected(&manager).await;

        manager.receive(
            remote.id(),
            r#"{"jsonrpc":"2.0","method":"Calc.add","params":{"args":[2,3]},"id":"r1"}"#,
        );
        assert_eq!(recv(&mut rx).await, json!({"jsonrpc": "2.0", "result": 5, "id": "r1"}));
    }

    #[tokio::test]
    async fn test_inbound_discovery_is_answered_through_registry() {
        let manager = manager();
        let (remote, mut rx) = connected(&manager).await;

        manager.receive(
            remote.id(),
            r#"{"jsonrpc":"2.0","method":"system.listComponents","params":[],"id":1}"#,
        );
        assert_eq!(
            recv(&mut rx).await,
            json!({"jsonrpc": "2.0", "result": {"Calc.add": true}, "id": 1})
        );
    }

    #[tokio::test]
    async fn test_batch_items_are_handled_independently() {
        let manager = manager();
        let (remote, mut rx) = connected(&manager).await;

        manager.receive(
            remote.id(),
            r#"[
                {"jsonrpc":"2.0","method":"Calc.add","params":[1,1],"id":1},
                {"jsonrpc":"2.0","method":7,"id":2},
                {"jsonrpc":"2.0","method":"Calc.nope","id":3}
            ]"#,
        );

        let mut replies = Vec::new();
        for _ in 0..3 {
            replies.push(recv(&mut rx).await);
        }
        replies.sort_by_key(|reply| reply["id"].as_i64());
        assert_eq!(replies[0]["result"], json!(2));
        assert_eq!(replies[1]["error"]["code"], json!(-32600));
        assert_eq!(replies[2]["error"]["code"], json!(-32601));
    }

    #[tokio::test]
    async fn test_parse_error_without_id_is_dropped() {
        let manager = manager();
        let (remote, mut rx) = connected(&manager).await;

        manager.receive(remote.id(), "{this is not json");
        assert!(nothing_sent(&mut rx).await);
        assert!(!remote.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_request_with_id_is_answered() {
        let manager = manager();
        let (remote, mut rx) = connected(&manager).await;

        manager.receive(remote.id(), r#"{"method":"Calc.add","id":7}"#);
        let reply = recv(&mut rx).await;
        assert_eq!(reply["id"], json!(7));
        assert_eq!(reply["error"]["code"], json!(-32600));
    }

    #[tokio::test]
    async fn test_malformed_response_is_not_answered() {
        let manager = manager();
        let (remote, mut rx) = connected(&manager).await;

        manager.receive(remote.id(), r#"{"jsonrpc":"2.0","error":"bad","id":2}"#);
        manager.receive(remote.id(), r#"{"jsonrpc":"2.0","id":3}"#);
        manager.receive(remote.id(), r#"[{"result":1,"id":4}]"#);
        assert!(nothing_sent(&mut rx).await);
        assert!(!remote.is_closed());
    }

    #[tokio::test]
    async fn test_response_resolves_pending_call() {
        let manager = manager();
        let (remote, mut rx) = connected(&manager).await;

        let chain = remote.call("Peer.echo", vec![json!("x")]);
        let request = recv(&mut rx).await;
        let id = RequestId::from_value(&request["id"]).unwrap();

        manager.receive(remote.id(), &Envelope::result(id, json!("x")).encode());
        assert_eq!(chain.await, Ok(json!("x")));
    }

    #[tokio::test]
    async fn test_register_announces_to_remotes() {
        let manager = manager();
        let (_remote, mut rx) = connected(&manager).await;

        manager.register(&Exposed::new("Echo").method("echo", |p| p.arg::<String>(0)), None);
        let announce = recv(&mut rx).await;
        assert_eq!(announce["method"], json!(ANNOUNCE));
        assert!(announce.get("id").is_none());

        // nothing new, nothing announced
        manager.register(&Exposed::new("Echo").method("echo", |p| p.arg::<String>(0)), None);
        assert!(nothing_sent(&mut rx).await);
    }

    #[tokio::test]
    async fn test_announce_triggers_rate_limited_resync() {
        let manager = manager();
        let (remote, mut rx) = connected(&manager).await;
        let announce = r#"{"jsonrpc":"2.0","method":"system.announce","params":[]}"#;

        manager.receive(remote.id(), announce);
        assert_eq!(recv(&mut rx).await["method"], json!(LIST_COMPONENTS));

        // within the interval: deferred, then coalesced
        manager.receive(remote.id(), announce);
        manager.receive(remote.id(), announce);
        assert!(nothing_sent(&mut rx).await);

        // the deferred re-sync still runs, exactly once
        assert_eq!(recv(&mut rx).await["method"], json!(LIST_COMPONENTS));
        assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_remove_remote_rejects_pending_and_emits() {
        let manager = manager();
        let (remote, _rx) = connected(&manager).await;
        let mut events = manager.subscribe();
        let chain = remote.call("Peer.slow", Params::empty());

        assert!(manager.remove_remote(remote.id()));
        assert!(!manager.remove_remote(remote.id()));
        assert_eq!(chain.await, Err(birpc_common::RpcError::RemoteClosed));
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::RemoteDisconnected(remote.id())
        );
        assert!(manager.remote(remote.id()).is_none());
    }

    #[tokio::test]
    async fn test_closed_remote_is_removed() {
        let manager = manager();
        let (remote, _rx) = connected(&manager).await;
        let mut events = manager.subscribe();

        remote.close();
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::RemoteDisconnected(remote.id())
        );
        assert!(manager.remote_ids().is_empty());
    }

    #[tokio::test]
    async fn test_receive_for_unknown_remote_is_ignored() {
        let manager = manager();
        manager.receive(uuid::Uuid::new_v4(), r#"{"jsonrpc":"2.0","result":1,"id":1}"#);
    }

    #[tokio::test]
    async fn test_invoke_local() {
        let manager = manager();
        assert_eq!(
            manager.invoke_local("Calc.add", vec![json!(4), json!(5)]).await,
            Ok(json!(9))
        );
    }
}
