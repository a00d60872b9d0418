// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker transport trait definitions.

use async_trait::async_trait;
use thiserror::Error;

/// Errors from broker operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// Broker unreachable or connection lost. Recovered by reconnecting.
    #[error("Broker connectivity error: {0}")]
    Connectivity(String),

    /// Subscribe request could not be issued or was refused.
    #[error("Subscription to '{topic}' failed: {message}")]
    Subscription {
        /// Topic filter of the failed subscription.
        topic: String,
        /// Transport or broker message.
        message: String,
    },

    /// Broker URL or options are unusable.
    #[error("Invalid broker configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Something that happened on the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// A connection was established.
    Connected {
        /// `false` for the first connection, `true` for every later one.
        reconnect: bool,
        /// Broker the connection was made to.
        server_uri: String,
    },
    /// A message arrived on a subscribed topic.
    Message {
        /// Topic the message was published to.
        topic: String,
        /// Opaque payload.
        payload: Vec<u8>,
    },
    /// The connection was lost. The transport reconnects on its own.
    ConnectionLost {
        /// What broke the connection.
        cause: String,
    },
}

/// One logical, self-reconnecting broker connection.
///
/// The transport is driven by [`next_event`](Self::next_event): connecting,
/// reconnecting with backoff and keep-alive all happen inside that call.
/// Dropping the returned future must be safe, since callers race it against
/// a stop signal.
#[async_trait]
pub trait BrokerTransport: Send {
    /// Wait for the next connection event.
    async fn next_event(&mut self) -> BrokerEvent;

    /// Ask the broker for messages matching `topic`.
    ///
    /// Must not wait for the broker's acknowledgement: it is called from the
    /// same task that drives [`next_event`](Self::next_event).
    async fn subscribe(&mut self, topic: &str) -> Result<()>;

    /// Close the connection.
    async fn disconnect(&mut self);

    /// Broker URI, for logging.
    fn server_uri(&self) -> &str;
}
