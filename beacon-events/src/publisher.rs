//! Event publisher
//!
//! Serializes application events, stamps the `timestamp` and `eventType`
//! attributes and hands the result to the broker. Publish failures are
//! always returned to the caller.

use chrono::Utc;
use dashmap::DashSet;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::broker::{probe_topic, Broker};
use crate::codec::{Encoder, JsonCodec};
use crate::error::Result;
use crate::message::{Attributes, Message, MessageId};

pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    /// Topics known to exist on the broker
    known_topics: DashSet<String>,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            known_topics: DashSet::new(),
        }
    }

    /// Whether `topic` exists on the broker. A failed probe reports `false`.
    pub async fn topic_exists(&self, topic: &str) -> bool {
        if self.known_topics.contains(topic) {
            return true;
        }
        let exists = probe_topic(self.broker.as_ref(), topic).await;
        if exists {
            self.known_topics.insert(topic.to_string());
        }
        exists
    }

    /// Make sure `topic` exists, creating it on first reference
    pub async fn ensure_topic(&self, topic: &str) -> Result<()> {
        if self.topic_exists(topic).await {
            return Ok(());
        }
        self.broker.create_topic(topic).await?;
        info!(topic = %topic, "Topic created");
        self.known_topics.insert(topic.to_string());
        Ok(())
    }

    /// Publish `data` as JSON
    pub async fn publish<T>(&self, topic: &str, data: &T, attributes: Attributes) -> Result<MessageId>
    where
        T: Serialize + 'static,
    {
        self.publish_with(topic, data, attributes, &JsonCodec::<T>::new())
            .await
    }

    pub async fn publish_with<T, C>(
        &self,
        topic: &str,
        data: &T,
        attributes: Attributes,
        codec: &C,
    ) -> Result<MessageId>
    where
        C: Encoder<T>,
    {
        let payload = codec.encode(data)?;
        self.publish_message(
            topic,
            Message {
                payload,
                attributes,
            },
        )
        .await
    }

    /// Publish an already serialized message. `timestamp` and `eventType`
    /// are always overwritten.
    pub async fn publish_message(&self, topic: &str, mut message: Message) -> Result<MessageId> {
        self.ensure_topic(topic).await?;
        message.stamp(topic, Utc::now());

        match self.broker.publish(topic, message).await {
            Ok(id) => {
                debug!(topic = %topic, message_id = %id, "Message published");
                Ok(id)
            }
            Err(e) => {
                error!(topic = %topic, error = %e, "Failed to publish message");
                Err(e)
            }
        }
    }
}
