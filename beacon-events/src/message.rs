//! Message envelope shared by publishers, brokers and subscribers

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Attribute holding the publish-time clock reading (RFC 3339)
pub const TIMESTAMP_ATTRIBUTE: &str = "timestamp";
/// Attribute holding the topic the message was published to
pub const EVENT_TYPE_ATTRIBUTE: &str = "eventType";

pub type Attributes = HashMap<String, String>;

/// Broker-assigned message identifier
pub type MessageId = String;

/// A serialized payload plus string attributes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub payload: Bytes,
    pub attributes: Attributes,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            attributes: Attributes::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// The `eventType` attribute, when present
    #[must_use]
    pub fn event_type(&self) -> Option<&str> {
        self.attribute(EVENT_TYPE_ATTRIBUTE)
    }

    /// Stamp `timestamp` and `eventType`, overriding any caller-supplied values
    pub(crate) fn stamp(&mut self, topic: &str, now: DateTime<Utc>) {
        self.attributes
            .insert(TIMESTAMP_ATTRIBUTE.to_string(), now.to_rfc3339());
        self.attributes
            .insert(EVENT_TYPE_ATTRIBUTE.to_string(), topic.to_string());
    }
}

/// A message as handed to a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: MessageId,
    /// Handle used to ack or nack this particular delivery
    pub ack_id: String,
    pub message: Message,
    pub publish_time: DateTime<Utc>,
    /// 1 on first delivery, incremented on every redelivery
    pub delivery_attempt: u32,
}

impl ReceivedMessage {
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    #[must_use]
    pub fn attributes(&self) -> &Attributes {
        &self.message.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_overrides_reserved_attributes() {
        let now = Utc::now();
        let mut message = Message::new("{}")
            .with_attribute("eventType", "spoofed")
            .with_attribute("source", "billing");
        message.stamp("orders", now);

        assert_eq!(message.event_type(), Some("orders"));
        assert_eq!(message.attribute("timestamp"), Some(now.to_rfc3339().as_str()));
        assert_eq!(message.attribute("source"), Some("billing"));
    }
}
