//! Event subscriber
//!
//! Each `(consumer, topic)` pair maps to one durable broker subscription
//! named `{consumer}-{topic}-subscription`. Subscribing twice to the same
//! pair is a no-op. Every active subscription runs a dispatch task that
//! pulls deliveries, decodes them and runs the handler in its own task,
//! with at most `max_outstanding` handlers in flight. The handler's
//! [`HandlerOutcome`] decides between ack and nack.

use async_trait::async_trait;
use beacon_core::BrokerConfig;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{probe_topic, Broker, BrokerSubscription, Delivery, SubscriptionEvent};
use crate::codec::{Decoder, JsonCodec};
use crate::error::{BrokerError, Result};
use crate::message::ReceivedMessage;

const DEFAULT_MAX_OUTSTANDING: usize = 100;

/// Deterministic broker subscription name for a consumer/topic pair
#[must_use]
pub fn subscription_name(consumer: &str, topic: &str) -> String {
    format!("{consumer}-{topic}-subscription")
}

/// What the dispatcher should do with a delivery once the handler returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Processed; remove it from the broker
    Ack,
    /// Not processed; have the broker redeliver it
    Nack,
}

impl<E> From<std::result::Result<(), E>> for HandlerOutcome {
    fn from(result: std::result::Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Ack,
            Err(_) => Self::Nack,
        }
    }
}

#[async_trait]
pub trait MessageHandler<T: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, message: ReceivedMessage, data: T) -> HandlerOutcome;
}

#[async_trait]
impl<T, F, Fut, O> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(ReceivedMessage, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send,
    O: Into<HandlerOutcome> + Send,
{
    async fn handle(&self, message: ReceivedMessage, data: T) -> HandlerOutcome {
        (self)(message, data).await.into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubscriptionKey {
    consumer: String,
    topic: String,
}

struct ActiveSubscription {
    name: String,
    cancel_token: CancellationToken,
    task: JoinHandle<Box<dyn BrokerSubscription>>,
}

pub struct EventSubscriber {
    broker: Arc<dyn Broker>,
    max_outstanding: usize,
    subscriptions: Mutex<HashMap<SubscriptionKey, ActiveSubscription>>,
}

impl EventSubscriber {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(broker: Arc<dyn Broker>, config: &BrokerConfig) -> Self {
        Self::new(broker).with_max_outstanding(config.max_outstanding_messages)
    }

    /// Cap on concurrently running handlers per subscription (at least 1)
    #[must_use]
    pub fn with_max_outstanding(mut self, max_outstanding: usize) -> Self {
        self.max_outstanding = max_outstanding.max(1);
        self
    }

    /// Subscribe `consumer` to `topic`, decoding payloads as JSON
    pub async fn subscribe<T, H>(&self, consumer: &str, topic: &str, handler: H) -> Result<()>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        self.subscribe_with(consumer, topic, handler, JsonCodec::<T>::new())
            .await
    }

    /// Subscribe with an explicit codec. Topic and subscription setup
    /// failures are returned; an existing subscription for the pair is reused.
    pub async fn subscribe_with<T, H, C>(
        &self,
        consumer: &str,
        topic: &str,
        handler: H,
        codec: C,
    ) -> Result<()>
    where
        T: Send + 'static,
        H: MessageHandler<T>,
        C: Decoder<T>,
    {
        let key = SubscriptionKey {
            consumer: consumer.to_string(),
            topic: topic.to_string(),
        };

        // Held across setup so concurrent calls for one pair create one subscription
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(&key) {
            debug!(consumer = %consumer, topic = %topic, "Already subscribed");
            return Ok(());
        }

        if !probe_topic(self.broker.as_ref(), topic).await {
            self.broker.create_topic(topic).await?;
            info!(topic = %topic, "Topic created");
        }

        let name = subscription_name(consumer, topic);
        let subscription = self.broker.create_subscription(topic, &name).await?;

        let cancel_token = CancellationToken::new();
        let dispatcher = Dispatcher {
            handler: Arc::new(handler),
            codec: Arc::new(codec),
            permits: Arc::new(Semaphore::new(self.max_outstanding)),
            subscription: name.clone(),
        };
        let task = tokio::spawn(dispatcher.run(subscription, cancel_token.clone()));

        info!(subscription = %name, topic = %topic, "Subscribed");
        subscriptions.insert(
            key,
            ActiveSubscription {
                name,
                cancel_token,
                task,
            },
        );
        Ok(())
    }

    /// Stop delivery for the pair, wait for in-flight handlers, then close
    /// the broker subscription. No-op when not subscribed.
    pub async fn unsubscribe(&self, consumer: &str, topic: &str) -> Result<()> {
        let key = SubscriptionKey {
            consumer: consumer.to_string(),
            topic: topic.to_string(),
        };
        let Some(active) = self.subscriptions.lock().await.remove(&key) else {
            return Ok(());
        };
        shutdown(active).await
    }

    /// Close every subscription. All are attempted; the first failure is
    /// returned afterwards.
    pub async fn close_all(&self) -> Result<()> {
        let drained: Vec<ActiveSubscription> = self
            .subscriptions
            .lock()
            .await
            .drain()
            .map(|(_, active)| active)
            .collect();

        let mut first_error = None;
        for active in drained {
            if let Err(e) = shutdown(active).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn is_subscribed(&self, consumer: &str, topic: &str) -> bool {
        self.subscriptions.lock().await.contains_key(&SubscriptionKey {
            consumer: consumer.to_string(),
            topic: topic.to_string(),
        })
    }

    /// Broker subscription names currently tracked, sorted
    pub async fn active_subscriptions(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .subscriptions
            .lock()
            .await
            .values()
            .map(|active| active.name.clone())
            .collect();
        names.sort();
        names
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        for active in self.subscriptions.get_mut().values() {
            active.cancel_token.cancel();
        }
    }
}

async fn shutdown(active: ActiveSubscription) -> Result<()> {
    active.cancel_token.cancel();
    let mut subscription = active.task.await.map_err(|e| {
        BrokerError::backend(format!("Dispatch task for {} failed: {e}", active.name))
    })?;

    match subscription.close().await {
        Ok(()) => {
            info!(subscription = %active.name, "Unsubscribed");
            Ok(())
        }
        Err(e) => {
            error!(subscription = %active.name, error = %e, "Failed to close subscription");
            Err(e)
        }
    }
}

struct Dispatcher<T, C> {
    handler: Arc<dyn MessageHandler<T>>,
    codec: Arc<C>,
    permits: Arc<Semaphore>,
    subscription: String,
}

impl<T, C> Dispatcher<T, C>
where
    T: Send + 'static,
    C: Decoder<T>,
{
    /// Pull deliveries until cancelled; hands the subscription back once
    /// every in-flight handler has settled
    async fn run(
        self,
        mut subscription: Box<dyn BrokerSubscription>,
        cancel: CancellationToken,
    ) -> Box<dyn BrokerSubscription> {
        let mut in_flight = JoinSet::new();

        loop {
            let permit = tokio::select! {
                () = cancel.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = subscription.next_event() => event,
            };

            match event {
                Some(SubscriptionEvent::Delivery(delivery)) => {
                    let handler = Arc::clone(&self.handler);
                    let codec = Arc::clone(&self.codec);
                    let name = self.subscription.clone();
                    in_flight.spawn(async move {
                        dispatch(delivery, codec.as_ref(), handler.as_ref(), &name).await;
                        drop(permit);
                    });
                }
                Some(SubscriptionEvent::Error(e)) => {
                    error!(subscription = %self.subscription, error = %e, "Subscription error");
                }
                None => {
                    warn!(subscription = %self.subscription, "Subscription closed by broker");
                    break;
                }
            }

            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}
        debug!(subscription = %self.subscription, "Dispatch loop stopped");
        subscription
    }
}

/// Decode, run the handler and settle one delivery. Decode failures and
/// handler panics are settled as a nack.
pub(crate) async fn dispatch<T, C, H>(
    delivery: Delivery,
    codec: &C,
    handler: &H,
    subscription: &str,
) -> HandlerOutcome
where
    T: Send + 'static,
    C: Decoder<T> + ?Sized,
    H: MessageHandler<T> + ?Sized,
{
    let message = delivery.message().clone();
    debug!(
        subscription = %subscription,
        message_id = %message.id,
        attempt = message.delivery_attempt,
        "Dispatching message"
    );

    let outcome = match codec.decode(&message.message.payload) {
        Ok(data) => {
            let message_id = message.id.clone();
            match AssertUnwindSafe(handler.handle(message, data))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(subscription = %subscription, message_id = %message_id, "Handler panicked");
                    HandlerOutcome::Nack
                }
            }
        }
        Err(e) => {
            warn!(subscription = %subscription, message_id = %message.id, error = %e, "Undecodable payload");
            HandlerOutcome::Nack
        }
    };

    let message_id = delivery.message().id.clone();
    let settled = match outcome {
        HandlerOutcome::Ack => delivery.ack().await,
        HandlerOutcome::Nack => {
            warn!(subscription = %subscription, message_id = %message_id, "Message nacked");
            delivery.nack().await
        }
    };
    if let Err(e) = settled {
        error!(subscription = %subscription, message_id = %message_id, error = %e, "Failed to settle message");
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockAcknowledger;
    use crate::message::Message;
    use bytes::Bytes;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PolicyCreated {
        policy_id: String,
    }

    fn delivery(payload: &'static [u8], acknowledger: MockAcknowledger) -> Delivery {
        Delivery::new(
            ReceivedMessage {
                id: "m-1".to_string(),
                ack_id: "ack-1".to_string(),
                message: Message::new(Bytes::from_static(payload)),
                publish_time: Utc::now(),
                delivery_attempt: 1,
            },
            Arc::new(acknowledger),
        )
    }

    fn expect_ack() -> MockAcknowledger {
        let mut acknowledger = MockAcknowledger::new();
        acknowledger
            .expect_ack()
            .withf(|id| id == "ack-1")
            .times(1)
            .returning(|_| Ok(()));
        acknowledger.expect_nack().times(0);
        acknowledger
    }

    fn expect_nack() -> MockAcknowledger {
        let mut acknowledger = MockAcknowledger::new();
        acknowledger
            .expect_nack()
            .withf(|id| id == "ack-1")
            .times(1)
            .returning(|_| Ok(()));
        acknowledger.expect_ack().times(0);
        acknowledger
    }

    #[test]
    fn test_subscription_name() {
        assert_eq!(
            subscription_name("billing", "policy.created"),
            "billing-policy.created-subscription"
        );
    }

    #[test]
    fn test_outcome_from_result() {
        assert_eq!(HandlerOutcome::from(Ok::<(), String>(())), HandlerOutcome::Ack);
        assert_eq!(
            HandlerOutcome::from(Err::<(), _>("boom")),
            HandlerOutcome::Nack
        );
    }

    #[tokio::test]
    async fn test_successful_handler_acks() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handler = move |_msg: ReceivedMessage, data: PolicyCreated| {
            let counter = Arc::clone(&counter);
            async move {
                assert_eq!(data.policy_id, "p-1");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        };

        let outcome = dispatch(
            delivery(br#"{"policy_id":"p-1"}"#, expect_ack()),
            &JsonCodec::<PolicyCreated>::new(),
            &handler,
            "billing-policy-subscription",
        )
        .await;

        assert_eq!(outcome, HandlerOutcome::Ack);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_nacks() {
        let handler = |_msg: ReceivedMessage, _data: PolicyCreated| async {
            Err::<(), _>("downstream unavailable")
        };

        let outcome = dispatch(
            delivery(br#"{"policy_id":"p-1"}"#, expect_nack()),
            &JsonCodec::<PolicyCreated>::new(),
            &handler,
            "billing-policy-subscription",
        )
        .await;

        assert_eq!(outcome, HandlerOutcome::Nack);
    }

    #[tokio::test]
    async fn test_panicking_handler_nacks() {
        let handler = |_msg: ReceivedMessage, data: PolicyCreated| async move {
            if data.policy_id == "p-1" {
                panic!("handler bug");
            }
            HandlerOutcome::Ack
        };

        let outcome = dispatch(
            delivery(br#"{"policy_id":"p-1"}"#, expect_nack()),
            &JsonCodec::<PolicyCreated>::new(),
            &handler,
            "billing-policy-subscription",
        )
        .await;

        assert_eq!(outcome, HandlerOutcome::Nack);
    }

    #[tokio::test]
    async fn test_undecodable_payload_nacks_without_calling_handler() {
        let called = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&called);
        let handler = move |_msg: ReceivedMessage, _data: PolicyCreated| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { HandlerOutcome::Ack }
        };

        let outcome = dispatch(
            delivery(b"not json", expect_nack()),
            &JsonCodec::<PolicyCreated>::new(),
            &handler,
            "billing-policy-subscription",
        )
        .await;

        assert_eq!(outcome, HandlerOutcome::Nack);
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }
}
