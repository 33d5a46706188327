//! Broker abstraction
//!
//! A [`Broker`] owns topics and durable subscriptions. Attaching to a
//! subscription yields a [`BrokerSubscription`], a pull-style stream of
//! [`SubscriptionEvent`]s. Each delivery carries an [`Acknowledger`] so the
//! dispatcher can settle it without knowing which backend produced it.

pub mod memory;
pub mod redis_streams;

use async_trait::async_trait;
use beacon_core::{BrokerBackend, BrokerConfig};
use std::fmt;
use std::sync::Arc;

use crate::error::{BrokerError, Result};
use crate::message::{Message, MessageId, ReceivedMessage};

pub use memory::MemoryBroker;
pub use redis_streams::RedisStreamsBroker;

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn topic_exists(&self, topic: &str) -> Result<bool>;

    /// Create `topic`; creating an existing topic is not an error
    async fn create_topic(&self, topic: &str) -> Result<()>;

    async fn publish(&self, topic: &str, message: Message) -> Result<MessageId>;

    /// Create the durable subscription `name` on `topic`, or attach to it if
    /// it already exists
    async fn create_subscription(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<Box<dyn BrokerSubscription>>;
}

#[async_trait]
pub trait BrokerSubscription: Send + 'static {
    fn name(&self) -> &str;

    /// Next delivery or transport error; `None` once the subscription is closed
    async fn next_event(&mut self) -> Option<SubscriptionEvent>;

    /// Stop receiving. Unsettled deliveries become eligible for redelivery.
    async fn close(&mut self) -> Result<()>;
}

/// Settles deliveries on the backend that produced them
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self, ack_id: &str) -> Result<()>;
    async fn nack(&self, ack_id: &str) -> Result<()>;
}

pub enum SubscriptionEvent {
    Delivery(Delivery),
    /// Transport-level failure; the subscription stays open
    Error(BrokerError),
}

/// One delivered message together with its settlement handle
pub struct Delivery {
    message: ReceivedMessage,
    acknowledger: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: ReceivedMessage, acknowledger: Arc<dyn Acknowledger>) -> Self {
        Self {
            message,
            acknowledger,
        }
    }

    #[must_use]
    pub fn message(&self) -> &ReceivedMessage {
        &self.message
    }

    pub async fn ack(self) -> Result<()> {
        self.acknowledger.ack(&self.message.ack_id).await
    }

    pub async fn nack(self) -> Result<()> {
        self.acknowledger.nack(&self.message.ack_id).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Probe for `topic`, treating a failed probe as absence
pub(crate) async fn probe_topic(broker: &dyn Broker, topic: &str) -> bool {
    match broker.topic_exists(topic).await {
        Ok(exists) => exists,
        Err(e) => {
            tracing::warn!(topic = %topic, error = %e, "Topic existence check failed");
            false
        }
    }
}

/// Connect to the backend named in `config`
pub async fn connect_broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    match config.backend {
        BrokerBackend::Memory => Ok(Arc::new(
            MemoryBroker::new().with_redelivery_delay(config.redelivery_delay()),
        )),
        BrokerBackend::Redis => {
            let broker = RedisStreamsBroker::connect(
                &config.endpoint(),
                &config.project_id,
                config.redelivery_delay(),
            )
            .await?
            .with_claim_idle(config.claim_idle());
            let broker = match config.consumer_name.as_deref() {
                Some(name) => broker.with_consumer_name(name),
                None => broker,
            };
            Ok(Arc::new(broker))
        }
    }
}
