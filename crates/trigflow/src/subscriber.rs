// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resilient topic subscriber.
//!
//! [`ReconnectingSubscriber`] drives a [`BrokerTransport`] from one
//! background task. Registered subscriptions are replayed after every
//! (re)connect, because a clean-session broker forgets them with the old
//! connection. Inbound messages go, in delivery order, to the handler of the
//! first registered filter that matches.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{BrokerEvent, BrokerTransport};
use crate::error::{Error, Result};
use crate::lifecycle::{Service, ServiceHealth, ServiceTask};

/// Receives messages for a subscription.
///
/// Called on the subscriber's task: implementations must return quickly and
/// hand long work to another task.
pub trait MessageHandler: Send + Sync {
    /// Handle one message.
    fn on_message(&self, topic: &str, payload: &[u8]);
}

impl<F> MessageHandler for F
where
    F: Fn(&str, &[u8]) + Send + Sync,
{
    fn on_message(&self, topic: &str, payload: &[u8]) {
        self(topic, payload)
    }
}

/// Whether an MQTT topic filter matches a topic name.
///
/// `+` matches exactly one level, a trailing `#` matches any number of
/// levels including none.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Clone)]
struct Subscription {
    filter: String,
    handler: Arc<dyn MessageHandler>,
}

/// Owns one broker connection and the subscriptions made on it.
pub struct ReconnectingSubscriber {
    transport: Option<Box<dyn BrokerTransport>>,
    subscriptions: Vec<Subscription>,
    task: ServiceTask,
}

impl ReconnectingSubscriber {
    /// Create a subscriber over `transport`. Nothing happens until [`Service::start`].
    pub fn new(transport: Box<dyn BrokerTransport>) -> Self {
        Self {
            transport: Some(transport),
            subscriptions: Vec::new(),
            task: ServiceTask::new("subscriber"),
        }
    }

    /// Register `handler` for `filter`, replacing any handler already
    /// registered for the same filter.
    ///
    /// Subscriptions must be registered before the subscriber is started.
    pub fn subscribe(&mut self, filter: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let filter = filter.into();
        match self.subscriptions.iter_mut().find(|s| s.filter == filter) {
            Some(existing) => existing.handler = handler,
            None => self.subscriptions.push(Subscription { filter, handler }),
        }
    }

    /// Registered topic filters, in registration order.
    pub fn topics(&self) -> Vec<&str> {
        self.subscriptions.iter().map(|s| s.filter.as_str()).collect()
    }
}

#[async_trait]
impl Service for ReconnectingSubscriber {
    fn name(&self) -> &str {
        self.task.name()
    }

    async fn start(&mut self) -> Result<()> {
        let transport = self
            .transport
            .take()
            .ok_or_else(|| Error::AlreadyStarted(self.task.name().to_string()))?;
        let subscriptions = self.subscriptions.clone();
        let cancel = self.task.cancel_token();

        info!(
            server_uri = %transport.server_uri(),
            topics = ?self.topics(),
            "Subscriber starting"
        );
        self.task.spawn(async move {
            run_subscriber(transport, subscriptions, cancel).await;
            Ok(())
        })
    }

    async fn stop(&mut self, grace: Duration) -> Result<()> {
        self.task.stop(grace).await
    }

    fn health(&self) -> ServiceHealth {
        self.task.health()
    }
}

async fn run_subscriber(
    mut transport: Box<dyn BrokerTransport>,
    subscriptions: Vec<Subscription>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("Subscriber received shutdown signal");
                break;
            }

            event = transport.next_event() => event,
        };

        match event {
            BrokerEvent::Connected {
                reconnect,
                server_uri,
            } => {
                info!(server_uri = %server_uri, reconnect, "Connected to broker");
                resubscribe(transport.as_mut(), &subscriptions).await;
            }
            BrokerEvent::Message { topic, payload } => {
                match subscriptions
                    .iter()
                    .find(|s| topic_matches(&s.filter, &topic))
                {
                    Some(subscription) => {
                        debug!(topic = %topic, bytes = payload.len(), "Message received");
                        subscription.handler.on_message(&topic, &payload);
                    }
                    None => debug!(topic = %topic, "Message for unregistered topic dropped"),
                }
            }
            BrokerEvent::ConnectionLost { cause } => {
                // The transport reconnects on the next poll.
                info!(cause = %cause, "Broker connection lost");
            }
        }
    }

    transport.disconnect().await;
    info!("Subscriber stopped");
}

/// Issue every registered subscription. Failures wait for the next connect.
async fn resubscribe(transport: &mut dyn BrokerTransport, subscriptions: &[Subscription]) {
    for subscription in subscriptions {
        match transport.subscribe(&subscription.filter).await {
            Ok(()) => debug!(topic = %subscription.filter, "Subscribed"),
            Err(e) => warn!(
                topic = %subscription.filter,
                error = %e,
                "Subscription failed, retrying on next reconnect"
            ),
        }
    }
}
