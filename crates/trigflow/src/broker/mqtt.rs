// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! MQTT transport backed by rumqttc.
//!
//! rumqttc reconnects whenever its event loop is polled again after an error.
//! This transport adds the pause between attempts (1s doubling to 30s, reset
//! once a connection is acknowledged) and turns the packet stream into
//! [`BrokerEvent`]s.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode};
use tracing::{debug, info, warn};
use url::Url;

use super::traits::*;
use crate::config::BrokerConfig;

const DEFAULT_PORT: u16 = 1883;
const REQUEST_CAPACITY: usize = 64;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Broker transport speaking MQTT 3.1.1.
pub struct MqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
    server_uri: String,
    connected_once: bool,
    backoff: Backoff,
    pending_delay: Option<Duration>,
    /// Topics handed to the client, waiting for their packet id.
    queued_subscriptions: VecDeque<String>,
    /// Subscribe packets waiting for their SubAck.
    inflight_subscriptions: HashMap<u16, String>,
}

impl MqttTransport {
    /// Create a transport for the configured broker. Nothing is sent until
    /// the first [`next_event`](BrokerTransport::next_event).
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let (host, port) = parse_broker_url(&config.url)?;

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_clean_session(config.clean_session);
        options.set_keep_alive(config.keep_alive.max(Duration::from_secs(5)));

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        Ok(Self {
            client,
            eventloop,
            server_uri: config.url.clone(),
            connected_once: false,
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(30)),
            pending_delay: None,
            queued_subscriptions: VecDeque::new(),
            inflight_subscriptions: HashMap::new(),
        })
    }
}

/// Split `tcp://host:port` (or `mqtt://`) into host and port.
fn parse_broker_url(raw: &str) -> Result<(String, u16)> {
    let url = Url::parse(raw)
        .map_err(|e| BrokerError::InvalidConfig(format!("invalid broker URL '{}': {}", raw, e)))?;

    match url.scheme() {
        "tcp" | "mqtt" => {}
        other => {
            return Err(BrokerError::InvalidConfig(format!(
                "unsupported broker scheme '{}' (expected tcp or mqtt)",
                other
            )));
        }
    }

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| BrokerError::InvalidConfig(format!("broker URL '{}' has no host", raw)))?;

    Ok((host.to_string(), url.port().unwrap_or(DEFAULT_PORT)))
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn next_event(&mut self) -> BrokerEvent {
        if let Some(delay) = self.pending_delay.take() {
            debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnecting");
            tokio::time::sleep(delay).await;
        }

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.backoff.reset();
                    let reconnect = self.connected_once;
                    self.connected_once = true;
                    return BrokerEvent::Connected {
                        reconnect,
                        server_uri: self.server_uri.clone(),
                    };
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return BrokerEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                }
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                    if let Some(topic) = self.queued_subscriptions.pop_front() {
                        self.inflight_subscriptions.insert(pkid, topic);
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let topic = self
                        .inflight_subscriptions
                        .remove(&ack.pkid)
                        .unwrap_or_default();
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        let err = BrokerError::Subscription {
                            topic: topic.clone(),
                            message: "refused by broker".to_string(),
                        };
                        warn!(topic = %topic, error = %err, "Subscription refused");
                    } else {
                        debug!(topic = %topic, "Subscription acknowledged");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    self.inflight_subscriptions.clear();
                    self.pending_delay = Some(self.backoff.next_delay());
                    return BrokerEvent::ConnectionLost {
                        cause: e.to_string(),
                    };
                }
            }
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| BrokerError::Subscription {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;
        self.queued_subscriptions.push_back(topic.to_string());
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "Disconnect request not queued");
            return;
        }

        let eventloop = &mut self.eventloop;
        let drain = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };

        match tokio::time::timeout(DISCONNECT_TIMEOUT, drain).await {
            Ok(()) => info!(server_uri = %self.server_uri, "Disconnected from broker"),
            Err(_) => warn!(server_uri = %self.server_uri, "Broker did not confirm disconnect"),
        }
    }

    fn server_uri(&self) -> &str {
        &self.server_uri
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker_url() {
        assert_eq!(
            parse_broker_url("tcp://localhost:1883").unwrap(),
            ("localhost".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("mqtt://broker.plant.local").unwrap(),
            ("broker.plant.local".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("tcp://10.0.0.5:2883").unwrap(),
            ("10.0.0.5".to_string(), 2883)
        );
    }

    #[test]
    fn test_parse_broker_url_rejects_unknown_scheme() {
        assert!(matches!(
            parse_broker_url("http://localhost:1883"),
            Err(BrokerError::InvalidConfig(_))
        ));
        assert!(matches!(
            parse_broker_url("not a url"),
            Err(BrokerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_backoff_doubles_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 16, 30, 30]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_new_transport_reports_uri() {
        let config = BrokerConfig::default();
        let transport = MqttTransport::new(&config).unwrap();
        assert_eq!(transport.server_uri(), "tcp://localhost:1883");
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_connection_lost() {
        let config = BrokerConfig {
            url: "tcp://127.0.0.1:1".to_string(),
            ..BrokerConfig::default()
        };
        let mut transport = MqttTransport::new(&config).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), transport.next_event())
            .await
            .unwrap();
        assert!(matches!(event, BrokerEvent::ConnectionLost { .. }));
    }
}
