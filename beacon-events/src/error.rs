//! Broker-side error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl BrokerError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
