//! Tests for Remote calls, discovery and lifecycle

#[cfg(test)]
mod tests {
    use super::super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn remote() -> (Arc<Remote>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Remote::new(tx, RemoteConfig::default()), rx)
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<String>) -> (String, Params, RequestId) {
        let text = rx.recv().await.expect("transport closed");
        match Envelope::decode(&text).unwrap() {
            Envelope::Request { method, params, id } => (method, params, id),
            other => panic!("expected a request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_resolves_with_result() {
        let (remote, mut rx) = remote();
        let chain = remote.call("Calc.add", vec![json!(2), json!(3)]);

        let (method, params, id) = next_request(&mut rx).await;
        assert_eq!(method, "Calc.add");
        assert_eq!(params.into_vec(), vec![json!(2), json!(3)]);

        assert!(remote.handle_response(Envelope::result(id, json!(5))));
        assert_eq!(chain.await, Ok(json!(5)));
    }

    #[tokio::test]
    async fn test_call_rejects_with_remote_error() {
        let (remote, mut rx) = remote();
        let chain = remote.call("Calc.subtract", vec![json!(1), json!(2)]);
        let (_, _, id) = next_request(&mut rx).await;

        remote.handle_response(Envelope::error(
            Some(id),
            birpc_common::ErrorObject::method_not_found("Calc.subtract"),
        ));
        let err = chain.await.unwrap_err();
        assert_eq!(err.code(), -32601);
        assert!(err.to_string().contains("Method not found: Calc.subtract"));
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_out_of_order_responses_match() {
        let (remote, mut rx) = remote();
        let first = remote.call("A.one", Params::empty());
        let second = remote.call("A.two", Params::empty());
        let (_, _, first_id) = next_request(&mut rx).await;
        let (_, _, second_id) = next_request(&mut rx).await;
        assert_ne!(first_id, second_id);

        remote.handle_response(Envelope::result(second_id, json!(2)));
        remote.handle_response(Envelope::result(first_id, json!(1)));
        assert_eq!(first.await, Ok(json!(1)));
        assert_eq!(second.await, Ok(json!(2)));
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let remote = Remote::new(
            tx,
            RemoteConfig::default().with_call_timeout(Duration::from_millis(20)),
        );
        let err = remote.call("Slow.op", Params::empty()).await.unwrap_err();
        assert!(matches!(err, RpcError::TimedOut { .. }));
        assert_eq!(remote.pending_calls(), 0);
        assert!(!remote.is_closed());
    }

    #[tokio::test]
    async fn test_close_rejects_pending_calls() {
        let (remote, _rx) = remote();
        let chain = remote.call("A.b", Params::empty());
        assert!(remote.close());
        assert!(!remote.close());
        assert_eq!(chain.await, Err(RpcError::RemoteClosed));
        assert_eq!(remote.state(), RemoteState::Closed);
    }

    #[tokio::test]
    async fn test_call_after_close_fails_fast() {
        let (remote, _rx) = remote();
        remote.close();
        assert_eq!(
            remote.call("A.b", Params::empty()).await,
            Err(RpcError::RemoteClosed)
        );
    }

    #[tokio::test]
    async fn test_transmit_failure_closes_remote() {
        let (remote, rx) = remote();
        drop(rx);
        let err = remote.call("A.b", Params::empty()).await.unwrap_err();
        assert_eq!(err, RpcError::RemoteClosed);
        assert!(remote.is_closed());
    }

    #[tokio::test]
    async fn test_discovery_moves_to_ready() {
        let (remote, mut rx) = remote();
        assert_eq!(remote.state(), RemoteState::Connecting);

        let discovery = remote.discover();
        assert_eq!(remote.state(), RemoteState::Discovering);

        let (method, params, id) = next_request(&mut rx).await;
        assert_eq!(method, LIST_COMPONENTS);
        assert!(params.is_empty());

        remote.handle_response(Envelope::result(id, json!({"Calc.add": true})));
        assert_eq!(discovery.await, Ok(vec!["Calc.add".to_string()]));
        assert_eq!(remote.state(), RemoteState::Ready);
        assert!(remote.has_method("Calc.add"));
        remote.wait_ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_discovery_request_wire_form() {
        let (remote, mut rx) = remote();
        let _discovery = remote.discover();
        let text = rx.recv().await.unwrap();
        let wire: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(wire["method"], json!("system.listComponents"));
        assert_eq!(wire["params"], json!([]));
    }

    #[tokio::test]
    async fn test_resync_merges_without_discarding() {
        let (remote, mut rx) = remote();
        let first = remote.discover();
        let (_, _, id) = next_request(&mut rx).await;
        remote.handle_response(Envelope::result(id, json!({"A.one": true})));
        first.await.unwrap();
        let stub = remote.method("A.one").unwrap();

        let second = remote.discover();
        assert_eq!(remote.state(), RemoteState::Ready);
        let (_, _, id) = next_request(&mut rx).await;
        remote.handle_response(Envelope::result(id, json!({"A.two": true})));
        assert_eq!(second.await, Ok(vec!["A.two".to_string()]));

        let names: Vec<_> = remote.methods().into_iter().collect();
        assert_eq!(names, vec!["A.one".to_string(), "A.two".to_string()]);

        // the old stub still works
        let call = stub.call(vec![json!(1)]);
        let (method, _, id) = next_request(&mut rx).await;
        assert_eq!(method, "A.one");
        remote.handle_response(Envelope::result(id, json!("ok")));
        assert_eq!(call.await, Ok(json!("ok")));
    }

    #[tokio::test]
    async fn test_repeated_discovery_is_idempotent() {
        let (remote, mut rx) = remote();
        for _ in 0..2 {
            let discovery = remote.discover();
            let (_, _, id) = next_request(&mut rx).await;
            remote.handle_response(Envelope::result(id, json!({"A.one": true})));
            discovery.await.unwrap();
        }
        assert_eq!(remote.methods().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_ready_fails_when_closed() {
        let (remote, _rx) = remote();
        let waiter = {
            let remote = remote.clone();
            tokio::spawn(async move { remote.wait_ready().await })
        };
        remote.close();
        assert_eq!(waiter.await.unwrap(), Err(RpcError::RemoteClosed));
    }

    #[tokio::test]
    async fn test_failed_discovery_wakes_wait_ready() {
        let (remote, mut rx) = remote();
        let waiter = {
            let remote = remote.clone();
            tokio::spawn(async move { remote.wait_ready().await })
        };

        let discovery = remote.discover();
        let (_, _, id) = next_request(&mut rx).await;
        remote.handle_response(Envelope::error(
            Some(id),
            birpc_common::ErrorObject::new(-32000, "not today"),
        ));

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.code(), -32000);
        assert_eq!(discovery.await, Err(err.clone()));
        assert_eq!(remote.discovery_error(), Some(err.clone()));
        assert_eq!(remote.state(), RemoteState::Discovering);
        assert!(!remote.is_closed());

        // a later waiter sees the same failure instead of hanging
        assert_eq!(remote.wait_ready().await, Err(err));
    }

    #[tokio::test]
    async fn test_discovery_timeout_wakes_wait_ready() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let remote = Remote::new(
            tx,
            RemoteConfig::default().with_call_timeout(Duration::from_millis(20)),
        );
        let _discovery = remote.discover();
        let err = remote.wait_ready().await.unwrap_err();
        assert!(matches!(err, RpcError::TimedOut { .. }));
        assert_eq!(remote.state(), RemoteState::Discovering);
    }

    #[tokio::test]
    async fn test_retried_discovery_clears_failure() {
        let (remote, mut rx) = remote();
        let first = remote.discover();
        let (_, _, id) = next_request(&mut rx).await;
        remote.handle_response(Envelope::error(
            Some(id),
            birpc_common::ErrorObject::new(-32000, "not yet"),
        ));
        assert!(first.await.is_err());

        let second = remote.discover();
        assert_eq!(remote.discovery_error(), None);
        let (_, _, id) = next_request(&mut rx).await;
        remote.handle_response(Envelope::result(id, json!({"A.one": true})));
        second.await.unwrap();
        remote.wait_ready().await.unwrap();
        assert_eq!(remote.state(), RemoteState::Ready);
    }

    #[tokio::test]
    async fn test_failed_resync_keeps_ready() {
        let (remote, mut rx) = remote();
        let first = remote.discover();
        let (_, _, id) = next_request(&mut rx).await;
        remote.handle_response(Envelope::result(id, json!({"A.one": true})));
        first.await.unwrap();

        let resync = remote.discover();
        let (_, _, id) = next_request(&mut rx).await;
        remote.handle_response(Envelope::error(
            Some(id),
            birpc_common::ErrorObject::new(-32000, "busy"),
        ));
        assert!(resync.await.is_err());
        assert_eq!(remote.state(), RemoteState::Ready);
        assert_eq!(remote.discovery_error(), None);
        assert!(remote.has_method("A.one"));
    }

    #[tokio::test]
    async fn test_close_drops_stubs_and_stub_calls_fail() {
        let (remote, mut rx) = remote();
        let discovery = remote.discover();
        let (_, _, id) = next_request(&mut rx).await;
        remote.handle_response(Envelope::result(id, json!({"A.one": true})));
        discovery.await.unwrap();

        let stub = remote.method("A.one").unwrap();
        remote.close();
        remote.wait_closed().await;
        assert!(remote.methods().is_empty());
        assert_eq!(stub.call(Params::empty()).await, Err(RpcError::RemoteClosed));
    }

    #[tokio::test]
    async fn test_stub_outliving_remote() {
        let (remote, mut rx) = remote();
        let discovery = remote.discover();
        let (_, _, id) = next_request(&mut rx).await;
        remote.handle_response(Envelope::result(id, json!({"A.one": true})));
        discovery.await.unwrap();

        let stub = remote.method("A.one").unwrap();
        drop(remote);
        assert_eq!(stub.notify(Params::empty()), Err(RpcError::RemoteClosed));
    }

    #[tokio::test]
    async fn test_notify_sends_notification() {
        let (remote, mut rx) = remote();
        remote.notify("Logger.flush", vec![json!("now")]).unwrap();
        let text = rx.recv().await.unwrap();
        assert_eq!(
            Envelope::decode(&text).unwrap(),
            Envelope::notification("Logger.flush", Params::new(vec![json!("now")]))
        );
        assert_eq!(remote.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_late_response_is_ignored() {
        let (remote, _rx) = remote();
        assert!(!remote.handle_response(Envelope::result(RequestId::Number(77), json!(1))));
        assert!(!remote.handle_response(Envelope::error(
            None,
            birpc_common::ErrorObject::parse_error()
        )));
    }

    #[test]
    fn test_remote_ids_are_unique() {
        let (a, _) = mpsc::unbounded_channel::<String>();
        let (b, _) = mpsc::unbounded_channel::<String>();
        let a = Remote::new(a, RemoteConfig::default());
        let b = Remote::new(b, RemoteConfig::default());
        assert_ne!(a.id(), b.id());
    }
}
