// SPDX-License-Identifier: MIT OR Apache-2.0
//! Message-level types: outbound properties, inbound parsed messages, and
//! per-publish bookkeeping.

use crate::topics::{CONTENT_TYPE_JSON, PROP_MESSAGE_TYPE, PROP_PROTOCOL_VERSION, PROTOCOL_VERSION};
use rumqttc::v5::mqttbytes::v5::PublishProperties;
use std::time::Instant;

/// Properties attached to one outbound message.
#[derive(Debug, Clone)]
pub struct MessageProperties {
    /// Message type (`mt` user property), e.g. `enr_req`.
    pub message_type: String,
    /// Correlation data echoed by the response; opaque bytes.
    pub correlation_data: Option<Vec<u8>>,
    /// Additional user properties beyond the required set.
    pub extra_user_properties: Vec<(String, String)>,
}

impl MessageProperties {
    /// Properties for a request of the given type with fresh correlation
    /// data.
    #[must_use]
    pub fn request(message_type: impl Into<String>, correlation_data: Vec<u8>) -> Self {
        Self {
            message_type: message_type.into(),
            correlation_data: Some(correlation_data),
            extra_user_properties: Vec::new(),
        }
    }

    /// Render into wire-level MQTT v5 publish properties, always including
    /// `pid`, `mt`, and the JSON content type.
    #[must_use]
    pub fn to_publish_properties(&self) -> PublishProperties {
        let mut user_properties = vec![
            (PROP_PROTOCOL_VERSION.to_owned(), PROTOCOL_VERSION.to_owned()),
            (PROP_MESSAGE_TYPE.to_owned(), self.message_type.clone()),
        ];
        user_properties.extend(self.extra_user_properties.iter().cloned());
        PublishProperties {
            correlation_data: self.correlation_data.clone().map(Into::into),
            content_type: Some(CONTENT_TYPE_JSON.to_owned()),
            user_properties,
            ..PublishProperties::default()
        }
    }
}

/// Bookkeeping for one outbound publish.
#[derive(Debug, Clone)]
pub struct MqttMessageInfo {
    /// Channel-assigned message id.
    pub message_id: u64,
    /// Correlation data attached to the message, if any.
    pub correlation_data: Option<Vec<u8>>,
    /// When the publish was handed to the transport.
    pub sent_time: Instant,
    /// Quality of service used.
    pub qos: u8,
    /// Acknowledgment reason code from the broker, once completed.
    pub code: Option<i32>,
}

/// One inbound message, with the wire properties the core cares about
/// already extracted.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Topic the message arrived on.
    pub topic: String,
    /// `mt` user property, empty when absent.
    pub message_type: String,
    /// `pid` user property, empty when absent.
    pub protocol_version: String,
    /// Correlation data, byte-for-byte as received.
    pub correlation_data: Option<Vec<u8>>,
    /// Declared content type.
    pub content_type: Option<String>,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl IncomingMessage {
    /// Extract the interesting properties from wire-level parts.
    #[must_use]
    pub fn from_wire(topic: &str, payload: &[u8], properties: Option<&PublishProperties>) -> Self {
        let mut message_type = String::new();
        let mut protocol_version = String::new();
        let mut correlation_data = None;
        let mut content_type = None;
        if let Some(props) = properties {
            for (key, value) in &props.user_properties {
                match key.as_str() {
                    PROP_MESSAGE_TYPE => message_type = value.clone(),
                    PROP_PROTOCOL_VERSION => protocol_version = value.clone(),
                    _ => {}
                }
            }
            correlation_data = props.correlation_data.as_ref().map(|b| b.to_vec());
            content_type = props.content_type.clone();
        }
        Self {
            topic: topic.to_owned(),
            message_type,
            protocol_version,
            correlation_data,
            content_type,
            payload: payload.to_vec(),
        }
    }

    /// Whether the sender speaks our protocol version.
    #[must_use]
    pub fn protocol_version_matches(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
    }
}
