// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the reconnecting subscriber against the mock broker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use trigflow::broker::{MockBroker, MockBrokerHandle};
use trigflow::lifecycle::{Service, ServiceHealth};
use trigflow::subscriber::{MessageHandler, ReconnectingSubscriber};

const TOPIC: &str = "mdt/inspector/UpperImage";
const WAIT: Duration = Duration::from_secs(5);

type Received = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

fn recorder() -> (Arc<dyn MessageHandler>, Received) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let handler: Arc<dyn MessageHandler> = Arc::new(move |topic: &str, payload: &[u8]| {
        sink.lock().unwrap().push((topic.to_string(), payload.to_vec()));
    });
    (handler, received)
}

async fn started_subscriber() -> (ReconnectingSubscriber, MockBrokerHandle, Received) {
    let (broker, handle) = MockBroker::new();
    let (handler, received) = recorder();
    let mut subscriber = ReconnectingSubscriber::new(Box::new(broker));
    subscriber.subscribe(TOPIC, handler);
    subscriber.start().await.unwrap();
    (subscriber, handle, received)
}

async fn wait_for_messages(received: &Received, count: usize) -> Vec<(String, Vec<u8>)> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let messages = received.lock().unwrap().clone();
        if messages.len() >= count || tokio::time::Instant::now() >= deadline {
            return messages;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Subscription Replay
// ============================================================================

#[tokio::test]
async fn test_subscribes_on_first_connect() {
    let (mut subscriber, handle, _) = started_subscriber().await;
    assert!(handle.subscribe_calls().await.is_empty());

    handle.connect().await;
    assert!(handle.wait_for_subscribe_calls(1, WAIT).await);
    assert_eq!(handle.active_subscriptions().await, [TOPIC]);

    subscriber.stop(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_resubscribe_is_idempotent() {
    let (mut subscriber, handle, received) = started_subscriber().await;

    handle.connect().await;
    handle.connect().await;
    assert!(handle.wait_for_subscribe_calls(2, WAIT).await);
    assert_eq!(handle.subscribe_calls().await, [TOPIC, TOPIC]);
    assert_eq!(handle.active_subscriptions().await, [TOPIC]);

    assert!(handle.publish(TOPIC, "1").await);
    assert_eq!(wait_for_messages(&received, 1).await.len(), 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(received.lock().unwrap().len(), 1);

    subscriber.stop(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_message_delivered_after_reconnect() {
    let (mut subscriber, handle, received) = started_subscriber().await;
    handle.connect().await;
    assert!(handle.wait_for_subscribe_calls(1, WAIT).await);

    handle.lose_connection("keep-alive timeout").await;
    assert!(!handle.publish(TOPIC, "lost").await);

    handle.connect().await;
    assert!(handle.wait_for_subscribe_calls(2, WAIT).await);
    assert!(handle.publish(TOPIC, "after").await);

    let messages = wait_for_messages(&received, 1).await;
    assert_eq!(messages, vec![(TOPIC.to_string(), b"after".to_vec())]);
    assert_eq!(subscriber.health(), ServiceHealth::Running);

    subscriber.stop(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_failed_resubscribe_waits_for_next_reconnect() {
    let (mut subscriber, handle, received) = started_subscriber().await;
    handle.fail_subscriptions(TOPIC, true).await;

    handle.connect().await;
    assert!(handle.wait_for_subscribe_calls(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    // No retry loop: one attempt per connect.
    assert_eq!(handle.subscribe_calls().await.len(), 1);
    assert!(handle.active_subscriptions().await.is_empty());
    assert_eq!(subscriber.health(), ServiceHealth::Running);

    handle.fail_subscriptions(TOPIC, false).await;
    handle.lose_connection("broker restart").await;
    handle.connect().await;
    assert!(handle.wait_for_subscribe_calls(2, WAIT).await);
    assert!(handle.publish(TOPIC, "ok").await);
    assert_eq!(wait_for_messages(&received, 1).await.len(), 1);

    subscriber.stop(WAIT).await.unwrap();
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_messages_delivered_in_order() {
    let (mut subscriber, handle, received) = started_subscriber().await;
    handle.connect().await;
    assert!(handle.wait_for_subscribe_calls(1, WAIT).await);

    for i in 0..20 {
        assert!(handle.publish(TOPIC, i.to_string()).await);
    }

    let payloads: Vec<String> = wait_for_messages(&received, 20)
        .await
        .into_iter()
        .map(|(_, p)| String::from_utf8(p).unwrap())
        .collect();
    let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    assert_eq!(payloads, expected);

    subscriber.stop(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_wildcard_filters_route_to_first_match() {
    let (broker, handle) = MockBroker::new();
    let (upper, upper_received) = recorder();
    let (rest, rest_received) = recorder();
    let mut subscriber = ReconnectingSubscriber::new(Box::new(broker));
    subscriber.subscribe("mdt/+/UpperImage", upper);
    subscriber.subscribe("mdt/#", rest);
    subscriber.start().await.unwrap();

    handle.connect().await;
    assert!(handle.wait_for_subscribe_calls(2, WAIT).await);
    assert!(handle.publish("mdt/inspector/UpperImage", "u").await);
    assert!(handle.publish("mdt/inspector/LowerImage", "l").await);

    assert_eq!(wait_for_messages(&upper_received, 1).await.len(), 1);
    assert_eq!(
        wait_for_messages(&rest_received, 1).await,
        vec![("mdt/inspector/LowerImage".to_string(), b"l".to_vec())]
    );
    assert_eq!(upper_received.lock().unwrap().len(), 1);

    subscriber.stop(WAIT).await.unwrap();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_stop_disconnects_transport() {
    let (mut subscriber, handle, _) = started_subscriber().await;
    handle.connect().await;
    assert!(handle.wait_for_subscribe_calls(1, WAIT).await);

    subscriber.stop(WAIT).await.unwrap();
    assert!(handle.is_disconnected().await);
    assert_eq!(subscriber.health(), ServiceHealth::Stopped);
    assert!(!handle.publish(TOPIC, "late").await);
}

#[tokio::test]
async fn test_start_twice_fails() {
    let (mut subscriber, _handle, _) = started_subscriber().await;
    assert!(subscriber.start().await.is_err());
    subscriber.stop(WAIT).await.unwrap();
}
