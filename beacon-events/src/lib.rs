//! Event bus adapters: a publisher that stamps and serializes events, and a
//! subscriber that keeps idempotent, durable subscriptions and settles each
//! delivery according to its handler's outcome. Delivery is at-least-once.

pub mod broker;
pub mod codec;
pub mod error;
pub mod message;
pub mod publisher;
pub mod subscriber;

pub use broker::{
    connect_broker, Acknowledger, Broker, BrokerSubscription, Delivery, MemoryBroker,
    RedisStreamsBroker, SubscriptionEvent,
};
pub use codec::{Decoder, Encoder, JsonCodec};
pub use error::{BrokerError, Result};
pub use message::{
    Attributes, Message, MessageId, ReceivedMessage, EVENT_TYPE_ATTRIBUTE, TIMESTAMP_ATTRIBUTE,
};
pub use publisher::EventPublisher;
pub use subscriber::{subscription_name, EventSubscriber, HandlerOutcome, MessageHandler};
