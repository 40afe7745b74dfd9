// SPDX-License-Identifier: MIT OR Apache-2.0
//! Topic templates and required message properties.
//!
//! Every message carries the `pid` (protocol version) and `mt` (message
//! type) user properties and a JSON content type; requests set correlation
//! data that responses must echo byte-for-byte.

/// User property carrying the protocol version.
pub const PROP_PROTOCOL_VERSION: &str = "pid";

/// User property carrying the message type.
pub const PROP_MESSAGE_TYPE: &str = "mt";

/// The protocol version this agent speaks.
pub const PROTOCOL_VERSION: &str = "1";

/// Content type of every payload.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Topic the agent publishes on: `adu/oto/{deviceId}/a[/{instance}]`.
#[must_use]
pub fn agent_topic(device_id: &str, instance: Option<&str>) -> String {
    match instance {
        Some(instance) => format!("adu/oto/{device_id}/a/{instance}"),
        None => format!("adu/oto/{device_id}/a"),
    }
}

/// Topic the service publishes on: `adu/oto/{deviceId}/s[/{instance}]`.
#[must_use]
pub fn service_topic(device_id: &str, instance: Option<&str>) -> String {
    match instance {
        Some(instance) => format!("adu/oto/{device_id}/s/{instance}"),
        None => format!("adu/oto/{device_id}/s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_without_instance() {
        assert_eq!(agent_topic("dev-1", None), "adu/oto/dev-1/a");
        assert_eq!(service_topic("dev-1", None), "adu/oto/dev-1/s");
    }

    #[test]
    fn topics_with_instance() {
        assert_eq!(agent_topic("dev-1", Some("blue")), "adu/oto/dev-1/a/blue");
        assert_eq!(service_topic("dev-1", Some("blue")), "adu/oto/dev-1/s/blue");
    }
}
