// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! dua-mqtt
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Message properties, inbound parsing, publish bookkeeping.
pub mod message;
/// Topic templates and required property names.
pub mod topics;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dua_retry::{RetryParams, jittered_backoff};
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use tracing::{debug, info, warn};

pub use message::{IncomingMessage, MessageProperties, MqttMessageInfo};
pub use rumqttc::v5::mqttbytes::QoS;
pub use topics::{PROTOCOL_VERSION, agent_topic, service_topic};

// ---------------------------------------------------------------------------
// Configuration and state
// ---------------------------------------------------------------------------

/// Connection settings for the channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Broker host name.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// MQTT client identity; one session per device.
    pub client_id: String,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Start with a clean session.
    pub clean_start: bool,
    /// Reconnect backoff tuning.
    pub reconnect: RetryParams,
}

impl ChannelConfig {
    /// Config for the given broker endpoint and client identity.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            keep_alive: Duration::from_secs(30),
            clean_start: false,
            reconnect: RetryParams {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                ..RetryParams::default()
            },
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No session; the next poll starts connecting.
    Disconnected,
    /// TCP/TLS/MQTT handshake in flight.
    Connecting,
    /// Session established; subscriptions are in place.
    Connected,
}

/// What one channel poll produced.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The session came up and all subscriptions were re-established.
    Connected,
    /// The session dropped; reconnect is scheduled with backoff.
    Disconnected,
    /// A message arrived on a subscribed topic.
    Message(IncomingMessage),
    /// The broker acknowledged an outbound publish.
    PublishCompleted(MqttMessageInfo),
    /// Nothing of interest (keep-alives, outgoing traffic, ...).
    None,
}

/// Errors surfaced by the publish API.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Fast-fail publish attempted while the session is down.
    #[error("not connected to the broker")]
    NotConnected,

    /// The underlying client rejected the request.
    #[error("mqtt client error: {0}")]
    Client(String),
}

struct QueuedPublish {
    message_id: u64,
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
    properties: MessageProperties,
}

// ---------------------------------------------------------------------------
// The channel
// ---------------------------------------------------------------------------

/// One MQTT v5 session to the broker, polled from the agent loop.
///
/// Subscriptions registered here survive reconnects: on every CONNACK the
/// set is re-established before deferred publishes are released. Publish
/// completion is reported in FIFO order per QoS≥1 acknowledgment, which is
/// exact for this agent's one-request-at-a-time operations.
pub struct MqttChannel {
    client: AsyncClient,
    event_loop: EventLoop,
    state: ChannelState,
    subscriptions: Vec<(String, QoS)>,
    deferred: VecDeque<QueuedPublish>,
    inflight: VecDeque<MqttMessageInfo>,
    next_message_id: u64,
    reconnect_attempt: u32,
    reconnect: RetryParams,
}

impl MqttChannel {
    /// Build the client and event loop; no I/O happens until polled.
    #[must_use]
    pub fn new(config: &ChannelConfig) -> Self {
        let mut options =
            MqttOptions::new(config.client_id.as_str(), config.host.as_str(), config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_start(config.clean_start);
        let (client, event_loop) = AsyncClient::new(options, 16);
        Self {
            client,
            event_loop,
            state: ChannelState::Disconnected,
            subscriptions: Vec::new(),
            deferred: VecDeque::new(),
            inflight: VecDeque::new(),
            next_message_id: 1,
            reconnect_attempt: 0,
            reconnect: config.reconnect,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Whether the session is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    /// Register a topic to (re-)subscribe on every connect.
    ///
    /// Each topic carries a single registration; re-registering replaces
    /// the QoS.
    pub fn register_subscription(&mut self, topic: impl Into<String>, qos: QoS) {
        let topic = topic.into();
        if let Some(entry) = self.subscriptions.iter_mut().find(|(t, _)| *t == topic) {
            entry.1 = qos;
        } else {
            self.subscriptions.push((topic, qos));
        }
    }

    /// Publish now; fails fast when disconnected.
    ///
    /// Returns the channel-assigned message id; completion for QoS≥1 is
    /// reported later via [`ChannelEvent::PublishCompleted`].
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        properties: &MessageProperties,
    ) -> Result<u64, ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        let message_id = self.allocate_message_id();
        self.send(message_id, topic, payload, qos, retain, properties)
            .await?;
        Ok(message_id)
    }

    /// Publish or, when disconnected, defer until the next connect.
    pub async fn publish_or_defer(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        properties: &MessageProperties,
    ) -> Result<u64, ChannelError> {
        let message_id = self.allocate_message_id();
        if self.is_connected() {
            self.send(message_id, topic, payload, qos, retain, properties)
                .await?;
        } else {
            debug!(topic, message_id, "channel down, deferring publish");
            self.deferred.push_back(QueuedPublish {
                message_id,
                topic: topic.to_owned(),
                payload,
                qos,
                retain,
                properties: properties.clone(),
            });
        }
        Ok(message_id)
    }

    /// Drive the session one event forward.
    ///
    /// Must be called continuously from the agent loop; reconnects (with
    /// backoff) happen inside.
    pub async fn poll(&mut self) -> ChannelEvent {
        if self.state == ChannelState::Disconnected {
            self.state = ChannelState::Connecting;
        }
        match self.event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt session established");
                self.state = ChannelState::Connected;
                self.reconnect_attempt = 0;
                self.restore_session().await;
                ChannelEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = String::from_utf8_lossy(&publish.topic).into_owned();
                let message = IncomingMessage::from_wire(
                    &topic,
                    &publish.payload,
                    publish.properties.as_ref(),
                );
                debug!(topic = %message.topic, mt = %message.message_type, "message received");
                ChannelEvent::Message(message)
            }
            Ok(Event::Incoming(Packet::PubAck(puback))) => match self.inflight.pop_front() {
                Some(mut info) => {
                    info.code = Some(puback.reason as i32);
                    ChannelEvent::PublishCompleted(info)
                }
                None => {
                    warn!("puback with no publish in flight");
                    ChannelEvent::None
                }
            },
            Ok(Event::Incoming(Packet::Disconnect(_))) => {
                warn!("broker disconnected the session");
                self.state = ChannelState::Disconnected;
                ChannelEvent::Disconnected
            }
            Ok(_) => ChannelEvent::None,
            Err(err) => {
                let was_connected = self.state == ChannelState::Connected;
                self.state = ChannelState::Disconnected;
                let delay = jittered_backoff(&self.reconnect, self.reconnect_attempt);
                self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
                warn!(%err, ?delay, "mqtt connection error, backing off");
                tokio::time::sleep(delay).await;
                if was_connected {
                    ChannelEvent::Disconnected
                } else {
                    ChannelEvent::None
                }
            }
        }
    }

    fn allocate_message_id(&mut self) -> u64 {
        let id = self.next_message_id;
        self.next_message_id += 1;
        id
    }

    async fn send(
        &mut self,
        message_id: u64,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        properties: &MessageProperties,
    ) -> Result<(), ChannelError> {
        self.client
            .publish_with_properties(
                topic,
                qos,
                retain,
                payload,
                properties.to_publish_properties(),
            )
            .await
            .map_err(|err| ChannelError::Client(err.to_string()))?;
        if qos != QoS::AtMostOnce {
            self.inflight.push_back(MqttMessageInfo {
                message_id,
                correlation_data: properties.correlation_data.clone(),
                sent_time: Instant::now(),
                qos: qos as u8,
                code: None,
            });
        }
        Ok(())
    }

    /// Re-establish all subscriptions, then release deferred publishes.
    async fn restore_session(&mut self) {
        for (topic, qos) in self.subscriptions.clone() {
            if let Err(err) = self.client.subscribe(topic.clone(), qos).await {
                warn!(topic, %err, "re-subscribe failed");
            }
        }
        while let Some(queued) = self.deferred.pop_front() {
            debug!(topic = %queued.topic, message_id = queued.message_id, "releasing deferred publish");
            if let Err(err) = self
                .send(
                    queued.message_id,
                    &queued.topic,
                    queued.payload,
                    queued.qos,
                    queued.retain,
                    &queued.properties,
                )
                .await
            {
                warn!(%err, "deferred publish failed");
            }
        }
    }
}
