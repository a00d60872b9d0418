// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock broker for testing.
//!
//! An in-process broker with clean-session semantics: losing the connection
//! drops every subscription, and a publish reaches the subscriber only if a
//! matching subscription is active at that moment. Tests drive it through a
//! [`MockBrokerHandle`].

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use super::traits::*;
use crate::subscriber::topic_matches;

const SERVER_URI: &str = "mock://broker";

#[derive(Debug, Default)]
struct MockBrokerState {
    connected: bool,
    connections: usize,
    active: BTreeSet<String>,
    subscribe_calls: Vec<String>,
    failing_subscriptions: HashSet<String>,
    disconnected: bool,
}

/// Transport half of the mock broker, handed to the subscriber.
pub struct MockBroker {
    events: mpsc::UnboundedReceiver<BrokerEvent>,
    state: Arc<Mutex<MockBrokerState>>,
}

/// Control half of the mock broker, kept by the test.
#[derive(Clone)]
pub struct MockBrokerHandle {
    events: mpsc::UnboundedSender<BrokerEvent>,
    state: Arc<Mutex<MockBrokerState>>,
}

impl MockBroker {
    /// Create a disconnected mock broker and its control handle.
    pub fn new() -> (Self, MockBrokerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(MockBrokerState::default()));
        (
            Self {
                events: rx,
                state: state.clone(),
            },
            MockBrokerHandle { events: tx, state },
        )
    }
}

impl MockBrokerHandle {
    /// Establish the connection (or re-establish it after a loss).
    pub async fn connect(&self) {
        let mut state = self.state.lock().await;
        state.connected = true;
        state.connections += 1;
        let _ = self.events.send(BrokerEvent::Connected {
            reconnect: state.connections > 1,
            server_uri: SERVER_URI.to_string(),
        });
    }

    /// Drop the connection. Every subscription is forgotten.
    pub async fn lose_connection(&self, cause: &str) {
        let mut state = self.state.lock().await;
        state.connected = false;
        state.active.clear();
        let _ = self.events.send(BrokerEvent::ConnectionLost {
            cause: cause.to_string(),
        });
    }

    /// Publish a message. Returns whether it was delivered.
    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let state = self.state.lock().await;
        let subscribed = state.active.iter().any(|filter| topic_matches(filter, topic));
        if !state.connected || !subscribed {
            return false;
        }
        self.events
            .send(BrokerEvent::Message {
                topic: topic.to_string(),
                payload: payload.into(),
            })
            .is_ok()
    }

    /// Refuse subscribe requests for `topic` until cleared.
    pub async fn fail_subscriptions(&self, topic: &str, fail: bool) {
        let mut state = self.state.lock().await;
        if fail {
            state.failing_subscriptions.insert(topic.to_string());
        } else {
            state.failing_subscriptions.remove(topic);
        }
    }

    /// Topic filters currently subscribed broker-side.
    pub async fn active_subscriptions(&self) -> Vec<String> {
        self.state.lock().await.active.iter().cloned().collect()
    }

    /// Every subscribe request received, in order, refused ones included.
    pub async fn subscribe_calls(&self) -> Vec<String> {
        self.state.lock().await.subscribe_calls.clone()
    }

    /// Whether the transport was closed.
    pub async fn is_disconnected(&self) -> bool {
        self.state.lock().await.disconnected
    }

    /// Wait until at least `count` subscribe requests were received.
    pub async fn wait_for_subscribe_calls(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.state.lock().await.subscribe_calls.len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl BrokerTransport for MockBroker {
    async fn next_event(&mut self) -> BrokerEvent {
        match self.events.recv().await {
            Some(event) => event,
            // Every handle is gone; nothing will ever happen again.
            None => std::future::pending().await,
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.subscribe_calls.push(topic.to_string());
        if !state.connected {
            return Err(BrokerError::Connectivity("not connected".to_string()));
        }
        if state.failing_subscriptions.contains(topic) {
            return Err(BrokerError::Subscription {
                topic: topic.to_string(),
                message: "refused by mock broker".to_string(),
            });
        }
        // Subscribing again to the same filter replaces the subscription.
        state.active.insert(topic.to_string());
        Ok(())
    }

    async fn disconnect(&mut self) {
        let mut state = self.state.lock().await;
        state.connected = false;
        state.disconnected = true;
        state.active.clear();
    }

    fn server_uri(&self) -> &str {
        SERVER_URI
    }
}
