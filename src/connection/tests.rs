//! Connection tests against the in-memory transport

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;
use tokio::time::timeout;

use super::*;
use crate::error::{ConnectionError, HandlerError};
use crate::message::{Message, PublishOptions};
use crate::protocol::QoS;
use crate::transport::{ConnectBehavior, MemoryHandle, MemoryTransport, TransportCall};

const ADDRESS: &str = "mqtt://192.168.1.144";
const WAIT: Duration = Duration::from_secs(1);

fn new_connection() -> (Connection, MemoryHandle) {
    let (transport, handle) = MemoryTransport::new();
    (Connection::new(transport, ConnectionOptions::default()), handle)
}

async fn connected() -> (Connection, MemoryHandle) {
    let (connection, handle) = new_connection();
    connection.connect(ADDRESS).await.unwrap();
    (connection, handle)
}

/// Emit a transport event and wait until the pump has announced `expect`
async fn emit_and_wait(
    connection: &Connection,
    handle: &MemoryHandle,
    event: TransportEvent,
    expect: ConnectionEvent,
) {
    let pending = waiter::arm(connection.events(), &[expect]);
    assert!(handle.emit(event));
    assert_eq!(pending.wait(WAIT).await.unwrap(), expect);
}

fn noop(_msg: &Message) -> Result<(), HandlerError> {
    Ok(())
}

// ============================================================================
// Connect
// ============================================================================

#[tokio::test]
async fn test_new_connection_is_idle() {
    let (connection, handle) = new_connection();
    assert_eq!(connection.current_state(), ConnectionState::Disconnected);
    assert_eq!(handle.call_count(), 0);
}

#[tokio::test]
async fn test_connect_success() {
    let (connection, handle) = connected().await;

    assert_eq!(connection.current_state(), ConnectionState::Connected);
    assert_eq!(handle.calls(), vec![TransportCall::Connect(ADDRESS.to_string())]);
    // The handshake wait detached its listeners
    assert_eq!(connection.events().listener_count(), 0);
}

#[tokio::test]
async fn test_open() {
    let (transport, _handle) = MemoryTransport::new();
    let connection = Connection::open(transport, ADDRESS, ConnectionOptions::default())
        .await
        .unwrap();
    assert!(connection.current_state().is_connected());
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let (connection, _handle) = connected().await;
    assert_eq!(
        connection.connect(ADDRESS).await,
        Err(BridgeError::Connection(ConnectionError::AlreadyConnected))
    );
    assert_eq!(connection.current_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_refused_handshake_fails_then_retry_succeeds() {
    let (connection, handle) = new_connection();
    handle.set_connect_behavior(ConnectBehavior::Refuse("Not authorized".to_string()));

    let result = connection.connect(ADDRESS).await;
    assert_eq!(
        result,
        Err(BridgeError::Connection(ConnectionError::Rejected(
            "Not authorized".to_string()
        )))
    );
    assert_eq!(connection.current_state(), ConnectionState::Failed);

    handle.set_connect_behavior(ConnectBehavior::Accept);
    connection.connect(ADDRESS).await.unwrap();
    assert_eq!(connection.current_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_unreachable_broker() {
    let (connection, handle) = new_connection();
    handle.set_connect_behavior(ConnectBehavior::Fail(ConnectionError::Unreachable(
        "connection refused".to_string(),
    )));

    let err = connection.connect(ADDRESS).await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Connection(ConnectionError::Unreachable(_))
    ));
    assert_eq!(connection.current_state(), ConnectionState::Failed);
}

#[tokio::test]
async fn test_handshake_timeout() {
    let (transport, handle) = MemoryTransport::new();
    handle.set_connect_behavior(ConnectBehavior::Silent);
    let connection = Connection::new(
        transport,
        ConnectionOptions::default().with_handshake_timeout(Duration::from_millis(50)),
    );

    let err = connection.connect(ADDRESS).await.unwrap_err();
    assert_eq!(
        err,
        BridgeError::Connection(ConnectionError::HandshakeTimeout)
    );
    assert_eq!(connection.current_state(), ConnectionState::Failed);
    assert_eq!(connection.events().listener_count(), 0);
    // The abandoned attempt is torn down
    assert_eq!(handle.calls().last(), Some(&TransportCall::Disconnect));
}

// ============================================================================
// Lifecycle events from the transport
// ============================================================================

#[tokio::test]
async fn test_session_loss_and_recovery() {
    let (connection, handle) = connected().await;

    emit_and_wait(
        &connection,
        &handle,
        TransportEvent::Disconnect(Some("broker went away".to_string())),
        ConnectionEvent::Disconnect,
    )
    .await;
    assert_eq!(connection.current_state(), ConnectionState::Disconnected);

    emit_and_wait(
        &connection,
        &handle,
        TransportEvent::Reconnect,
        ConnectionEvent::Reconnect,
    )
    .await;
    assert_eq!(connection.current_state(), ConnectionState::Connecting);

    emit_and_wait(
        &connection,
        &handle,
        TransportEvent::Connect,
        ConnectionEvent::Connect,
    )
    .await;
    assert_eq!(connection.current_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_error_while_connected_is_reported_only() {
    let (connection, handle) = connected().await;
    emit_and_wait(
        &connection,
        &handle,
        TransportEvent::Error("ping failed".to_string()),
        ConnectionEvent::Error,
    )
    .await;
    assert_eq!(connection.current_state(), ConnectionState::Connected);
}

// ============================================================================
// Subscribe / unsubscribe
// ============================================================================

#[tokio::test]
async fn test_subscriptions_before_connect_are_flushed() {
    let (connection, handle) = new_connection();
    connection.subscribe("dwm/#", noop).await.unwrap();
    connection.subscribe("dwm/#", noop).await.unwrap();
    connection
        .subscribe_with_qos("sys/+", QoS::AtLeastOnce, noop)
        .await
        .unwrap();
    assert_eq!(handle.subscribe_count(), 0);

    connection.connect(ADDRESS).await.unwrap();
    assert_eq!(
        handle.calls()[1..].to_vec(),
        vec![
            TransportCall::Subscribe("dwm/#".to_string(), QoS::AtMostOnce),
            TransportCall::Subscribe("sys/+".to_string(), QoS::AtLeastOnce),
        ]
    );
}

#[tokio::test]
async fn test_subscribe_forwards_new_filters_only() {
    let (connection, handle) = connected().await;

    connection.subscribe("a/+", noop).await.unwrap();
    connection.subscribe("a/+", noop).await.unwrap();
    assert_eq!(handle.subscribe_count(), 1);

    // A higher QoS on a known filter is forwarded again
    connection
        .subscribe_with_qos("a/+", QoS::ExactlyOnce, noop)
        .await
        .unwrap();
    assert_eq!(handle.subscribe_count(), 2);
    assert_eq!(connection.subscription_count(), 3);
}

#[tokio::test]
async fn test_subscribe_after_lost_session_is_kept_for_next_connect() {
    let (connection, handle) = connected().await;
    emit_and_wait(
        &connection,
        &handle,
        TransportEvent::Disconnect(None),
        ConnectionEvent::Disconnect,
    )
    .await;

    // The session task is gone; the transport refuses new filters
    handle.fail_filter_calls(Some(ConnectionError::Lost(
        "session task stopped".to_string(),
    )));
    let (_, mut rx) = connection.subscribe_channel("a/#", 8).await.unwrap();
    assert_eq!(connection.subscription_count(), 1);
    assert_eq!(handle.subscribe_count(), 0);

    handle.fail_filter_calls(None);
    connection.connect(ADDRESS).await.unwrap();
    assert_eq!(
        handle.calls().last(),
        Some(&TransportCall::Subscribe("a/#".to_string(), QoS::AtMostOnce))
    );

    handle.deliver(Message::new("a/b", "hey"));
    assert_eq!(rx.recv().await.unwrap().payload_str(), "hey");
}

#[tokio::test]
async fn test_unsubscribe_survives_transport_failure() {
    let (connection, handle) = connected().await;
    let sub = connection.subscribe("t/#", noop).await.unwrap();
    handle.fail_filter_calls(Some(ConnectionError::Lost("gone".to_string())));

    assert!(connection.unsubscribe(sub).await.unwrap());
    assert_eq!(connection.subscription_count(), 0);
    assert!(!handle
        .calls()
        .contains(&TransportCall::Unsubscribe("t/#".to_string())));
}

#[tokio::test]
async fn test_invalid_pattern() {
    let (connection, handle) = connected().await;

    for bad in ["", "a/#/b", "a/b#", "a+/b"] {
        let err = connection.subscribe(bad, noop).await.unwrap_err();
        assert!(
            matches!(err, BridgeError::InvalidPattern { .. }),
            "{:?} gave {:?}",
            bad,
            err
        );
    }
    assert_eq!(connection.subscription_count(), 0);
    assert_eq!(handle.subscribe_count(), 0);
}

#[tokio::test]
async fn test_unsubscribe_last_filter() {
    let (connection, handle) = connected().await;
    let first = connection.subscribe("t/#", noop).await.unwrap();
    let second = connection.subscribe("t/#", noop).await.unwrap();

    assert!(connection.unsubscribe(first).await.unwrap());
    assert!(!handle
        .calls()
        .contains(&TransportCall::Unsubscribe("t/#".to_string())));

    assert!(connection.unsubscribe(second).await.unwrap());
    assert!(!connection.unsubscribe(second).await.unwrap());
    assert_eq!(
        handle.calls().last(),
        Some(&TransportCall::Unsubscribe("t/#".to_string()))
    );
}

// ============================================================================
// Dispatch through the pump
// ============================================================================

#[tokio::test]
async fn test_messages_reach_channel_subscriber_in_order() {
    let (connection, handle) = connected().await;
    let (_sub, mut rx) = connection.subscribe_channel("dwm/node/+/uplink/#", 8).await.unwrap();

    handle.deliver(Message::new("dwm/node/1234/uplink/location", "1"));
    handle.deliver(Message::new("dwm/node/1234/downlink", "skip"));
    handle.deliver(Message::new("dwm/node/1234/uplink/data", "2").with_qos(QoS::AtLeastOnce));

    let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    let second = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.payload, Bytes::from("1"));
    assert_eq!(second.topic, "dwm/node/1234/uplink/data");
    assert_eq!(second.qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn test_full_channel_drops_and_reports() {
    let (connection, handle) = connected().await;
    let mut diagnostics = connection.diagnostics();
    let (_sub, mut rx) = connection.subscribe_channel("#", 1).await.unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    connection
        .subscribe("#", move |_msg: &Message| -> Result<(), HandlerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

    handle.deliver(Message::new("a", "kept"));
    handle.deliver(Message::new("b", "dropped"));

    let failure = timeout(WAIT, diagnostics.recv()).await.unwrap().unwrap();
    assert_eq!(failure.topic, "b");
    assert!(!failure.panicked);
    // The sibling handler still saw both messages
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    assert_eq!(rx.recv().await.unwrap().topic, "a");
}

// ============================================================================
// Publish
// ============================================================================

#[tokio::test]
async fn test_publish_requires_connection() {
    let (connection, handle) = new_connection();
    let err = connection
        .publish("#", "hey", PublishOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, BridgeError::NotConnected(ConnectionState::Disconnected));
    assert!(err.is_not_connected());
    assert_eq!(handle.publish_count(), 0);
}

#[tokio::test]
async fn test_publish_rejects_wildcard_topic() {
    let (connection, handle) = connected().await;
    for topic in ["#", "a/+/b", ""] {
        let err = connection
            .publish(topic, "hey", PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidTopic { .. }));
    }
    assert_eq!(handle.publish_count(), 0);
}

#[tokio::test]
async fn test_publish_passes_options_through() {
    let (connection, handle) = connected().await;
    connection
        .publish(
            "dwm/node/1/downlink/config",
            Bytes::from_static(b"{}"),
            PublishOptions::qos(QoS::AtLeastOnce).retained(),
        )
        .await
        .unwrap();

    assert_eq!(
        handle.calls().last(),
        Some(&TransportCall::Publish {
            topic: "dwm/node/1/downlink/config".to_string(),
            payload: Bytes::from_static(b"{}"),
            qos: QoS::AtLeastOnce,
            retain: true,
        })
    );
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_is_terminal_and_idempotent() {
    let (connection, handle) = connected().await;
    connection.subscribe("#", noop).await.unwrap();

    let closes = Arc::new(AtomicUsize::new(0));
    let counter = closes.clone();
    connection.events().on(ConnectionEvent::Close, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    connection.shutdown().await.unwrap();
    connection.shutdown().await.unwrap();

    assert!(connection.is_closed());
    assert_eq!(connection.current_state(), ConnectionState::Disconnected);
    assert_eq!(connection.subscription_count(), 0);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(
        handle
            .calls()
            .iter()
            .filter(|c| **c == TransportCall::Disconnect)
            .count(),
        1
    );

    assert_eq!(
        connection.connect(ADDRESS).await,
        Err(BridgeError::Connection(ConnectionError::Closed))
    );
    assert!(connection
        .publish("a", "b", PublishOptions::default())
        .await
        .unwrap_err()
        .is_not_connected());
}

#[tokio::test]
async fn test_shutdown_during_handshake_fails_the_connect() {
    let (transport, handle) = MemoryTransport::new();
    handle.set_connect_behavior(ConnectBehavior::Silent);
    let connection = Arc::new(Connection::new(transport, ConnectionOptions::default()));

    let connecting = tokio::spawn({
        let connection = connection.clone();
        async move { connection.connect(ADDRESS).await }
    });
    while handle.call_count() == 0 {
        tokio::task::yield_now().await;
    }

    let closing = tokio::spawn({
        let connection = connection.clone();
        async move { connection.shutdown().await }
    });
    while !connection.is_closed() {
        tokio::task::yield_now().await;
    }

    // The broker accepts after shutdown started
    assert!(handle.emit(TransportEvent::Connect));

    assert_eq!(
        connecting.await.unwrap(),
        Err(BridgeError::Connection(ConnectionError::Closed))
    );
    closing.await.unwrap().unwrap();
    assert_eq!(connection.current_state(), ConnectionState::Disconnected);
    assert_eq!(handle.calls().last(), Some(&TransportCall::Disconnect));
}

#[tokio::test]
async fn test_shutdown_without_connect_skips_transport() {
    let (connection, handle) = new_connection();
    connection.shutdown().await.unwrap();
    assert_eq!(handle.call_count(), 0);
}
