//! Relay and scope lifecycle tests.

use nativebridge_core::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

const TTL: Duration = Duration::from_millis(10_000);

struct RecordingHost {
    tx: mpsc::UnboundedSender<(i32, String)>,
}

impl HostCounterpart for RecordingHost {
    fn on_message(&self, code: i32, payload: String) {
        let _ = self.tx.send((code, payload));
    }
}

struct RecordingHandler {
    tx: mpsc::UnboundedSender<(i32, Value)>,
}

impl CallbackHandler for RecordingHandler {
    fn callback(&self, what: i32, payload: &Value) {
        let _ = self.tx.send((what, payload.clone()));
    }
}

fn relay() -> MessageRelay {
    let pool = WorkerPool::new("relay", 2).unwrap();
    MessageRelay::new(TTL, pool, Handle::current())
}

fn host() -> (Arc<RecordingHost>, mpsc::UnboundedReceiver<(i32, String)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingHost { tx }), rx)
}

// ============================================================================
// Script to host
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_buffered_messages_replay_in_order_with_fresh_codes() {
    let relay = relay();
    let scope = ScopeId::new();

    assert_eq!(relay.send_to_host(scope, "a".into(), None), RelayOutcome::Buffered);
    assert_eq!(relay.send_to_host(scope, "b".into(), None), RelayOutcome::Buffered);
    assert_eq!(relay.host_backlog(&scope), 2);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let (host, mut rx) = host();
    relay.attach_host(scope, host);

    assert_eq!(rx.recv().await, Some((1, "a".to_string())));
    assert_eq!(rx.recv().await, Some((2, "b".to_string())));
    assert_eq!(relay.host_backlog(&scope), 0);

    assert_eq!(relay.send_to_host(scope, "c".into(), None), RelayOutcome::Delivered);
    assert_eq!(rx.recv().await, Some((3, "c".to_string())));
}

#[tokio::test(start_paused = true)]
async fn test_expired_messages_are_dropped() {
    let relay = relay();
    let scope = ScopeId::new();

    relay.send_to_host(scope, "stale".into(), None);
    assert!(relay.is_eviction_armed());

    tokio::time::sleep(TTL + Duration::from_millis(50)).await;
    assert_eq!(relay.host_backlog(&scope), 0);

    let (host, mut rx) = host();
    relay.attach_host(scope, host);
    let nothing = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(nothing.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_host_reply_reaches_sender() {
    let relay = relay();
    let scope = ScopeId::new();
    let (host, mut rx) = host();
    relay.attach_host(scope, host);

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    let reply: DynCallback = Arc::new(FnCallback::new(move |response: Response| {
        let _ = reply_tx.send(response);
    }));
    relay.send_to_host(scope, "ping".into(), Some(reply));

    let (code, payload) = rx.recv().await.unwrap();
    assert_eq!(payload, "ping");
    assert_eq!(
        relay.send_to_script(scope, code, "pong".into()),
        RelayOutcome::Delivered
    );
    let response = reply_rx.recv().await.unwrap();
    assert_eq!(response.content().as_str(), Some("pong"));

    // A reply code is consumed by its first answer.
    assert_eq!(
        relay.send_to_script(scope, code, "again".into()),
        RelayOutcome::Dropped
    );
}

#[tokio::test(start_paused = true)]
async fn test_detach_discards_backlog() {
    let relay = relay();
    let scope = ScopeId::new();
    let (host, _rx) = host();
    relay.attach_host(scope, host);
    relay.detach_host(scope);

    assert_eq!(relay.send_to_host(scope, "late".into(), None), RelayOutcome::Buffered);
    relay.detach_host(scope);
    assert_eq!(relay.host_backlog(&scope), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sends_racing_host_attach_are_never_stranded() {
    const SENDERS: usize = 8;
    const PER_SENDER: usize = 25;

    for _ in 0..20 {
        let relay = Arc::new(relay());
        let scope = ScopeId::new();
        let (host, mut rx) = host();

        let senders: Vec<_> = (0..SENDERS)
            .map(|sender| {
                let relay = relay.clone();
                tokio::spawn(async move {
                    for i in 0..PER_SENDER {
                        relay.send_to_host(scope, format!("{sender}-{i}"), None);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        tokio::task::yield_now().await;
        relay.attach_host(scope, host);
        for sender in senders {
            sender.await.unwrap();
        }

        assert_eq!(relay.host_backlog(&scope), 0);
        let mut codes = std::collections::HashSet::new();
        for _ in 0..SENDERS * PER_SENDER {
            let (code, _) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("message stranded in the backlog")
                .unwrap();
            codes.insert(code);
        }
        assert_eq!(codes.len(), SENDERS * PER_SENDER);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registrations_racing_script_attach_are_never_stranded() {
    const MESSAGES: usize = 100;

    let relay = Arc::new(relay());
    let scope = ScopeId::new();
    let registry = Arc::new(PersistentCallbackRegistry::new("channel"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.put(CallbackContext::new(
        names::ACTION_REGISTER_CALLBACK,
        scope,
        false,
        Arc::new(RecordingHandler { tx }),
    ));

    let sender = {
        let relay = relay.clone();
        tokio::spawn(async move {
            for i in 0..MESSAGES {
                relay.send_to_script(scope, names::REGISTRATION_CODE, i.to_string());
                tokio::task::yield_now().await;
            }
        })
    };
    tokio::task::yield_now().await;
    relay.attach_script(scope, Arc::new(RegistryCounterpart::new(registry, scope)));
    sender.await.unwrap();

    assert_eq!(relay.script_backlog(&scope), 0);
    for _ in 0..MESSAGES {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("registration stranded in the backlog")
            .unwrap();
    }
}

// ============================================================================
// Host to script
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_registration_replays_into_persistent_callback() {
    let relay = relay();
    let scope = ScopeId::new();
    let registry = Arc::new(PersistentCallbackRegistry::new("channel"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.put(CallbackContext::new(
        names::ACTION_REGISTER_CALLBACK,
        scope,
        false,
        Arc::new(RecordingHandler { tx }),
    ));

    assert_eq!(
        relay.send_to_script(scope, names::REGISTRATION_CODE, "hello".into()),
        RelayOutcome::Buffered
    );
    assert_eq!(relay.script_backlog(&scope), 1);

    relay.attach_script(
        scope,
        Arc::new(RegistryCounterpart::new(registry.clone(), scope)),
    );
    let (what, payload) = rx.recv().await.unwrap();
    assert_eq!(what, names::REGISTRATION_CODE);
    assert_eq!(payload.as_str(), Some("hello"));

    assert_eq!(
        relay.send_to_script(scope, names::REGISTRATION_CODE, "again".into()),
        RelayOutcome::Delivered
    );
    assert_eq!(rx.recv().await.unwrap().1.as_str(), Some("again"));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_reply_code_is_dropped() {
    let relay = relay();
    let scope = ScopeId::new();
    assert_eq!(
        relay.send_to_script(scope, 42, "orphan".into()),
        RelayOutcome::Dropped
    );
    assert_eq!(relay.script_backlog(&scope), 0);
}

// ============================================================================
// Scope lifecycle
// ============================================================================

/// Keeps one persistent callback per scope and drops it on disposal.
struct Subscriber {
    registry: Arc<PersistentCallbackRegistry>,
    disposals: Mutex<Vec<bool>>,
}

struct Noop;

impl CallbackHandler for Noop {
    fn callback(&self, _what: i32, _payload: &Value) {}
}

#[async_trait::async_trait]
impl Extension for Subscriber {
    async fn invoke(&self, request: Request) -> ExtensionResult<Response> {
        let reserved = request.action() == "subscribeReserved";
        self.registry.put(CallbackContext::new(
            request.action(),
            request.scope(),
            reserved,
            Arc::new(Noop),
        ));
        Ok(Response::success())
    }

    fn dispose(&self, scope: ScopeId, force: bool) {
        self.disposals.lock().push(force);
        self.registry.dispose_all(scope, force);
    }
}

#[tokio::test]
async fn test_page_change_keeps_reserved_callbacks() {
    let registry = Arc::new(PersistentCallbackRegistry::new("events"));
    let subscriber = Arc::new(Subscriber {
        registry: registry.clone(),
        disposals: Mutex::new(Vec::new()),
    });
    let instance = subscriber.clone();
    let metadata = ExtensionMetadata::new("events", "events")
        .with_method(Method::new("subscribe", Mode::Sync).unwrap())
        .with_method(Method::new("subscribeReserved", Mode::Sync).unwrap());
    let factory: ExtensionFactory = Arc::new(move || Ok(instance.clone() as DynExtension));

    let ctx = BridgeContext::builder()
        .register_built_in(metadata, factory)
        .build()
        .unwrap();
    let scope = ctx.create_scope(ScopeInfo::new("com.example.app"));
    let dispatcher = ctx.dispatcher(scope);
    dispatcher.invoke("events", "subscribe", Value::Null, "", -1).await;
    dispatcher
        .invoke("events", "subscribeReserved", Value::Null, "", -1)
        .await;
    assert_eq!(registry.len(), 2);

    ctx.page_change(scope);
    assert!(!registry.contains(scope, "subscribe"));
    assert!(registry.contains(scope, "subscribeReserved"));

    ctx.destroy_scope(scope);
    assert!(registry.is_empty());
    assert!(ctx.scopes().get(&scope).is_none());
    assert_eq!(*subscriber.disposals.lock(), vec![false, true]);
}
