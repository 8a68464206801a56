//! Connection manager lifecycle tests
//!
//! Drives the manager through mock transports and checks the observable
//! outcomes: state snapshots, commands sent on the wire, and handler calls.


use realtime_link::config::{EndpointSection, Environment, Platform};
use realtime_link::connection::{
    handler, ConnectionManager, ConnectionSettings, ConnectionSnapshot, ConnectionStatus,
    SOCKET_CONNECTED, SOCKET_DISCONNECTED, SOCKET_ERROR,
};
use realtime_link::endpoint::EnvironmentEndpointResolver;
use realtime_link::error::ConnectionError;
use realtime_link::testing::{MockTokenProvider, MockTransportFactory};
use realtime_link::token::TokenGateway;
use realtime_link::transport::TransportEvent;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use test_helpers::{harness, harness_with, record_event, TEST_ENDPOINT};

#[tokio::test]
async fn test_chat_room_rejoined_once_after_transport_reconnect() {
    // Arrange
    let h = harness();
    h.manager.connect(Some("tokA".to_string())).await.unwrap();
    let transport = h.transport();
    transport.connect_ok("socket-1");
    h.manager.join_room("chat", "42");
    assert_eq!(
        transport.emitted_named("chat:join_room"),
        vec![json!({"roomId": "42"})]
    );
    transport.take_emitted();

    // Act: transport drops and reconnects on its own
    transport.drop_connection("transport close");
    assert_eq!(h.manager.get_snapshot(), ConnectionSnapshot::disconnected());
    transport.connect_ok("socket-2");

    // Assert
    assert_eq!(
        transport.emitted(),
        vec![("chat:join_room".to_string(), json!({"roomId": "42"}))]
    );
    assert_eq!(
        h.manager.get_snapshot(),
        ConnectionSnapshot {
            status: ConnectionStatus::Authenticated,
            error: None
        }
    );
    assert_eq!(h.factory.created_count(), 1);
}

#[tokio::test]
async fn test_rooms_queued_while_disconnected_replay_current_registry() {
    let h = harness();
    h.manager.join_room("order", "1");
    h.manager.join_room("chat", "42");
    h.manager.join_room("order", "2");
    h.manager.leave_room("order", "1");
    h.manager.join_room("chat", "42");

    let transport = h.connect_live("socket-1").await;

    assert_eq!(
        transport.emitted(),
        vec![
            ("chat:join_room".to_string(), json!({"roomId": "42"})),
            ("join_room".to_string(), json!({"roomId": "order:2"})),
        ]
    );
}

#[tokio::test]
async fn test_handlers_replayed_exactly_once_per_reconnect() {
    let h = harness();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let order_handler = handler(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    h.manager.on("order:update", order_handler.clone());
    h.manager.on("order:update", order_handler.clone());

    let transport = h.connect_live("socket-1").await;
    transport.server_event("order:update", json!({"id": 1}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    transport.drop_connection("ping timeout");
    transport.connect_ok("socket-2");
    transport.server_event("order:update", json!({"id": 1}));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_double_connect_creates_single_transport() {
    let h = harness();

    let (first, second) = tokio::join!(
        h.manager.connect(Some("tokA".to_string())),
        h.manager.connect(Some("tokA".to_string()))
    );

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(h.factory.created_count(), 1);
    assert_eq!(h.transport().open_count(), 1);
    assert_eq!(h.manager.get_snapshot().status, ConnectionStatus::Connecting);

    h.manager.connect(None).await.unwrap();
    assert_eq!(h.factory.created_count(), 1);
}

#[tokio::test]
async fn test_emit_returns_false_until_authenticated() {
    let h = harness();
    assert!(!h.manager.emit("order:ping", json!({})));

    h.manager.connect(None).await.unwrap();
    let transport = h.transport();
    assert!(!h.manager.emit("order:ping", json!({})));
    assert!(transport.emitted().is_empty());

    transport.connect_ok("socket-1");
    assert!(h.manager.emit("order:ping", json!({"n": 1})));
    assert_eq!(
        transport.emitted(),
        vec![("order:ping".to_string(), json!({"n": 1}))]
    );

    // Nothing buffered from the earlier attempts
    transport.drop_connection("transport close");
    assert!(!h.manager.emit("order:ping", json!({"n": 2})));
    transport.connect_ok("socket-2");
    assert_eq!(transport.emitted_named("order:ping").len(), 1);
}

#[tokio::test]
async fn test_emit_failure_reported_as_false() {
    let h = harness();
    let transport = h.connect_live("socket-1").await;
    transport.set_fail_emit(true);

    assert!(!h.manager.emit("order:ping", json!({})));
}

#[tokio::test]
async fn test_disconnect_preserves_rooms_and_handlers() {
    // Arrange
    let h = harness();
    let (received, _subscription) = record_event(&h.manager, "order:update");
    h.manager.join_room("order", "7");
    h.manager.join_room("chat", "42");
    let first = h.connect_live("socket-1").await;

    // Act
    h.manager.disconnect();

    // Assert
    let state = h.manager.get_connection_state();
    assert_eq!(state.rooms, vec!["chat:42", "order:7"]);
    assert!(!state.is_connected);
    assert!(!h.manager.is_connected());
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert!(first.closed());

    // Reconnecting restores both rooms and the handler
    let second = h.connect_live("socket-2").await;
    assert_eq!(h.factory.created_count(), 2);
    assert_eq!(
        second.emitted(),
        vec![
            ("chat:join_room".to_string(), json!({"roomId": "42"})),
            ("join_room".to_string(), json!({"roomId": "order:7"})),
        ]
    );
    second.server_event("order:update", json!({"status": "ready"}));
    assert_eq!(*received.lock().unwrap(), vec![json!({"status": "ready"})]);
}

#[tokio::test]
async fn test_leave_room_sends_leave_command_when_live() {
    let h = harness();
    let transport = h.connect_live("socket-1").await;
    h.manager.join_room("order", "9");
    h.manager.join_room("chat", "3");
    transport.take_emitted();

    h.manager.leave_room("order", "9");
    h.manager.leave_room("chat", "3");
    h.manager.leave_room("chat", "3");

    assert_eq!(
        transport.emitted(),
        vec![
            ("leave_room".to_string(), json!({"roomId": "order:9"})),
            ("chat:leave_room".to_string(), json!({"roomId": "3"})),
        ]
    );
    assert!(h.manager.rooms().is_empty());
}

#[tokio::test]
async fn test_off_and_unsubscribe_detach_handler() {
    let h = harness();
    let transport = h.connect_live("socket-1").await;

    let (recorded, subscription) = record_event(&h.manager, "chat:message");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let counting = handler(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    h.manager.on("chat:message", counting.clone());

    transport.server_event("chat:message", json!("hi"));
    subscription.unsubscribe();
    subscription.unsubscribe();
    h.manager.off("chat:message", &counting);
    transport.server_event("chat:message", json!("again"));

    assert_eq!(*recorded.lock().unwrap(), vec![json!("hi")]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!subscription.is_active());

    // Removed handlers are not replayed either
    transport.drop_connection("transport close");
    transport.connect_ok("socket-2");
    transport.server_event("chat:message", json!("after reconnect"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_lifecycle_events_use_handler_registry() {
    let h = harness();
    let (connected, _a) = record_event(&h.manager, SOCKET_CONNECTED);
    let (disconnected, _b) = record_event(&h.manager, SOCKET_DISCONNECTED);
    let (errors, _c) = record_event(&h.manager, SOCKET_ERROR);

    let transport = h.connect_live("socket-1").await;
    transport.drop_connection("ping timeout");
    transport.connect_error("websocket error: connection refused");

    assert_eq!(*connected.lock().unwrap(), vec![json!({"socketId": "socket-1"})]);
    assert_eq!(*disconnected.lock().unwrap(), vec![json!({"reason": "ping timeout"})]);
    assert_eq!(
        *errors.lock().unwrap(),
        vec![json!({"message": "websocket error: connection refused"})]
    );
}

#[tokio::test]
async fn test_network_error_leaves_reconnection_to_transport() {
    let h = harness();
    h.manager.connect(None).await.unwrap();
    let transport = h.transport();

    transport.connect_error("websocket error: connection refused");

    assert_eq!(
        h.manager.get_snapshot(),
        ConnectionSnapshot::error("websocket error: connection refused")
    );
    assert!(transport.reconnection_enabled());
    assert_eq!(h.provider.refresh_calls(), 0);

    transport.connect_ok("socket-1");
    assert_eq!(h.manager.get_snapshot(), ConnectionSnapshot::authenticated());
}

#[tokio::test]
async fn test_reconnect_failed_requires_explicit_connect() {
    let h = harness();
    let transport = h.connect_live("socket-1").await;
    transport.drop_connection("transport close");

    transport.fire(TransportEvent::ReconnectFailed);

    assert_eq!(
        h.manager.get_snapshot(),
        ConnectionSnapshot::error("Reconnection failed")
    );
    assert!(transport.closed());

    h.manager.connect(None).await.unwrap();
    assert_eq!(h.factory.created_count(), 2);
}

#[tokio::test]
async fn test_state_listeners_notified_in_order() {
    let h = harness();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for name in ["ui", "logger"] {
        let seen = seen.clone();
        h.manager.subscribe(Arc::new(move |snapshot: &ConnectionSnapshot| {
            seen.lock().unwrap().push((name, snapshot.status));
        }));
    }

    h.connect_live("socket-1").await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ("ui", ConnectionStatus::Connecting),
            ("logger", ConnectionStatus::Connecting),
            ("ui", ConnectionStatus::Authenticated),
            ("logger", ConnectionStatus::Authenticated),
        ]
    );
}

#[tokio::test]
async fn test_state_unsubscribe_stops_notifications() {
    let h = harness();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    let subscription = h.manager.subscribe(Arc::new(move |_: &ConnectionSnapshot| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    h.manager.connect(None).await.unwrap();
    subscription.unsubscribe();
    subscription.unsubscribe();
    h.transport().connect_ok("socket-1");

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_watch_receiver_tracks_latest_snapshot() {
    let h = harness();
    let mut rx = h.manager.watch();
    assert_eq!(*rx.borrow(), ConnectionSnapshot::disconnected());

    h.connect_live("socket-1").await;

    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), ConnectionSnapshot::authenticated());
}

#[tokio::test]
async fn test_connection_info_tracks_reconnects() {
    let h = harness();
    h.manager.join_room("order", "5");
    let transport = h.connect_live("socket-1").await;

    let info = h.manager.get_connection_state();
    assert!(info.is_connected);
    assert_eq!(info.socket_id.as_deref(), Some("socket-1"));
    assert_eq!(info.reconnect_count, 0);
    assert!(info.connected_at.is_some());

    transport.drop_connection("transport close");
    let info = h.manager.get_connection_state();
    assert!(!info.is_connected);
    assert_eq!(info.socket_id, None);

    transport.connect_ok("socket-2");
    let info = h.manager.get_connection_state();
    assert_eq!(info.socket_id.as_deref(), Some("socket-2"));
    assert_eq!(info.reconnect_count, 1);
    assert_eq!(info.rooms, vec!["order:5"]);
}

#[tokio::test]
async fn test_connect_uses_configured_options() {
    let h = harness();
    h.manager.connect(Some("tokZ".to_string())).await.unwrap();

    let transport = h.transport();
    let options = transport.options();
    assert_eq!(transport.endpoint(), TEST_ENDPOINT);
    assert!(!options.auto_connect);
    assert!(options.reconnection);
    assert_eq!(options.transports, vec!["websocket"]);
    assert_eq!(
        options.auth.to_payload(),
        json!({"token": "tokZ", "clientType": "mobile", "platform": "web"})
    );
}

#[tokio::test]
async fn test_missing_token_surfaces_error() {
    let h = harness_with(MockTransportFactory::new(), None);

    let result = h.manager.connect(None).await;

    assert!(matches!(result, Err(ConnectionError::MissingToken)));
    assert_eq!(
        h.manager.get_snapshot(),
        ConnectionSnapshot::error("No authentication token available")
    );
    assert_eq!(h.factory.created_count(), 0);
}

#[tokio::test]
async fn test_missing_endpoint_rejects_connect() {
    let factory = MockTransportFactory::new();
    let section = EndpointSection {
        environment: Environment::Production,
        platform: Platform::Ios,
        production_url: None,
        development_port: 3000,
        development_url: None,
    };
    let manager = ConnectionManager::new(
        factory.clone(),
        Arc::new(EnvironmentEndpointResolver::from_config(&section)),
        TokenGateway::new(Arc::new(MockTokenProvider::new(Some("tokA")))),
        ConnectionSettings::default(),
    );

    let result = manager.connect(None).await;

    assert!(matches!(result, Err(ConnectionError::Endpoint(_))));
    assert_eq!(manager.get_snapshot().status, ConnectionStatus::Error);
    assert_eq!(factory.created_count(), 0);

    // Error is not an active state, so a later connect is attempted again
    assert!(manager.connect(None).await.is_err());
}

#[tokio::test]
async fn test_transport_creation_failure_returned() {
    let h = harness_with(
        MockTransportFactory::new().with_create_error("bad options"),
        Some("tokA"),
    );

    let result = h.manager.connect(None).await;

    assert!(matches!(result, Err(ConnectionError::Transport(_))));
    assert_eq!(h.manager.get_snapshot().status, ConnectionStatus::Error);
}

#[tokio::test]
async fn test_cleanup_is_terminal() {
    let h = harness();
    let listener_calls = Arc::new(AtomicUsize::new(0));
    let counter = listener_calls.clone();
    h.manager.subscribe(Arc::new(move |_: &ConnectionSnapshot| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let (received, _subscription) = record_event(&h.manager, "order:update");
    h.manager.join_room("order", "1");
    let transport = h.connect_live("socket-1").await;
    let calls_before = listener_calls.load(Ordering::SeqCst);

    h.manager.cleanup();

    assert!(transport.closed());
    assert!(h.manager.rooms().is_empty());
    assert_eq!(h.manager.get_snapshot(), ConnectionSnapshot::disconnected());
    // The teardown transition itself is the last notification
    assert_eq!(listener_calls.load(Ordering::SeqCst), calls_before + 1);
    assert!(matches!(
        h.manager.connect(None).await,
        Err(ConnectionError::ShutDown)
    ));

    transport.server_event("order:update", json!({}));
    assert!(received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_handlers_may_call_back_into_manager() {
    let h = harness();
    let manager = h.manager.clone();
    let _subscription = h.manager.on(
        SOCKET_CONNECTED,
        handler(move |_| {
            manager.join_room("chat", "7");
            manager.emit("presence", json!({"online": true}));
        }),
    );

    let transport = h.connect_live("socket-1").await;

    assert_eq!(
        transport.emitted(),
        vec![
            ("chat:join_room".to_string(), json!({"roomId": "7"})),
            ("presence".to_string(), json!({"online": true})),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_store_agrees_with_manager_when_disconnect_races_handshake() {
    for _ in 0..500 {
        let h = harness();
        h.manager.connect(None).await.unwrap();
        let transport = h.transport();
        let barrier = std::sync::Barrier::new(2);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                barrier.wait();
                transport.connect_ok("socket-1");
            });
            scope.spawn(|| {
                barrier.wait();
                h.manager.disconnect();
            });
        });

        let info = h.manager.get_connection_state();
        let snapshot = h.manager.get_snapshot();
        assert_eq!(info.status, snapshot.status);
        assert_eq!(info.error, snapshot.error);
        assert_eq!(*h.manager.watch().borrow(), snapshot);
    }
}

#[tokio::test]
async fn test_connect_without_socket_id_still_authenticates() {
    let h = harness();
    let (connected, _sub) = record_event(&h.manager, SOCKET_CONNECTED);
    h.manager.connect(None).await.unwrap();

    h.transport()
        .fire(TransportEvent::Connected { socket_id: None });

    let info = h.manager.get_connection_state();
    assert!(info.is_connected);
    assert_eq!(info.status, ConnectionStatus::Authenticated);
    assert_eq!(info.socket_id, None);
    assert_eq!(*connected.lock().unwrap(), vec![json!({"socketId": null})]);
}

#[tokio::test]
async fn test_rooms_with_same_key_joined_once_on_replay() {
    let h = harness();
    h.manager.join_room("a:b", "c");
    h.manager.join_room("a", "b:c");

    let transport = h.connect_live("socket-1").await;

    assert_eq!(
        transport.emitted_named("join_room"),
        vec![json!({"roomId": "a:b:c"})]
    );
}
