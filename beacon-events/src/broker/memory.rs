//! In-process broker
//!
//! Topics fan out to every subscription created on them. Each subscription
//! keeps its own queue, so messages published while nobody is attached wait
//! for the next consumer. Nacked deliveries go back on the queue with their
//! attempt counter preserved; deliveries still unsettled when a handle
//! closes are requeued the same way.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use super::{Acknowledger, Broker, BrokerSubscription, Delivery, SubscriptionEvent};
use crate::error::{BrokerError, Result};
use crate::message::{Message, MessageId, ReceivedMessage};

#[derive(Clone)]
struct Queued {
    id: MessageId,
    message: Message,
    publish_time: DateTime<Utc>,
    deliveries: u32,
}

struct Outstanding {
    handle_id: u64,
    queued: Queued,
}

#[derive(Default)]
struct SubscriptionState {
    topic: String,
    queue: VecDeque<Queued>,
    outstanding: HashMap<String, Outstanding>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, HashSet<String>>,
    subscriptions: HashMap<String, SubscriptionState>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    next_message_id: AtomicU64,
    next_handle_id: AtomicU64,
    redelivery_delay: Mutex<Duration>,
}

impl Shared {
    fn requeue(&self, subscription: &str, queued: Queued) {
        let mut state = self.state.lock();
        if let Some(sub) = state.subscriptions.get_mut(subscription) {
            sub.queue.push_front(queued);
            sub.notify.notify_one();
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before a nacked message is visible again
    #[must_use]
    pub fn with_redelivery_delay(self, delay: Duration) -> Self {
        *self.shared.redelivery_delay.lock() = delay;
        self
    }

    /// Messages waiting on `subscription`, not counting unsettled deliveries
    #[must_use]
    pub fn backlog(&self, subscription: &str) -> usize {
        self.shared
            .state
            .lock()
            .subscriptions
            .get(subscription)
            .map_or(0, |sub| sub.queue.len())
    }

    /// Deliveries handed out on `subscription` but not yet acked or nacked
    #[must_use]
    pub fn outstanding(&self, subscription: &str) -> usize {
        self.shared
            .state
            .lock()
            .subscriptions
            .get(subscription)
            .map_or(0, |sub| sub.outstanding.len())
    }

    /// Names of the subscriptions created on `topic`
    #[must_use]
    pub fn subscriptions(&self, topic: &str) -> Vec<String> {
        let state = self.shared.state.lock();
        let mut names: Vec<String> = state
            .topics
            .get(topic)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        Ok(self.shared.state.lock().topics.contains_key(topic))
    }

    async fn create_topic(&self, topic: &str) -> Result<()> {
        self.shared
            .state
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default();
        Ok(())
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<MessageId> {
        let mut state = self.shared.state.lock();
        let State {
            topics,
            subscriptions,
        } = &mut *state;

        let subs = topics
            .get(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;

        let id = self
            .shared
            .next_message_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let queued = Queued {
            id: id.clone(),
            message,
            publish_time: Utc::now(),
            deliveries: 0,
        };

        for name in subs {
            if let Some(sub) = subscriptions.get_mut(name) {
                sub.queue.push_back(queued.clone());
                sub.notify.notify_one();
            }
        }

        Ok(id)
    }

    async fn create_subscription(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<Box<dyn BrokerSubscription>> {
        let notify = {
            let mut state = self.shared.state.lock();
            if !state.topics.contains_key(topic) {
                return Err(BrokerError::TopicNotFound(topic.to_string()));
            }
            if let Some(existing) = state.subscriptions.get(name) {
                if existing.topic != topic {
                    return Err(BrokerError::backend(format!(
                        "Subscription {name} already exists on topic {}",
                        existing.topic
                    )));
                }
            }

            if let Some(subs) = state.topics.get_mut(topic) {
                subs.insert(name.to_string());
            }
            let sub = state
                .subscriptions
                .entry(name.to_string())
                .or_insert_with(|| SubscriptionState {
                    topic: topic.to_string(),
                    ..SubscriptionState::default()
                });
            Arc::clone(&sub.notify)
        };

        let handle_id = self.shared.next_handle_id.fetch_add(1, Ordering::Relaxed);
        debug!(subscription = %name, topic = %topic, handle_id, "Attached to memory subscription");

        Ok(Box::new(MemorySubscription {
            name: name.to_string(),
            handle_id,
            notify,
            acknowledger: Arc::new(MemoryAcknowledger {
                shared: Arc::clone(&self.shared),
                subscription: name.to_string(),
            }),
            shared: Arc::clone(&self.shared),
            closed: false,
        }))
    }
}

struct MemorySubscription {
    name: String,
    handle_id: u64,
    notify: Arc<Notify>,
    acknowledger: Arc<MemoryAcknowledger>,
    shared: Arc<Shared>,
    closed: bool,
}

impl MemorySubscription {
    fn try_take(&self) -> Option<ReceivedMessage> {
        let mut state = self.shared.state.lock();
        let sub = state.subscriptions.get_mut(&self.name)?;
        let mut queued = sub.queue.pop_front()?;
        queued.deliveries += 1;

        let ack_id = nanoid::nanoid!();
        let received = ReceivedMessage {
            id: queued.id.clone(),
            ack_id: ack_id.clone(),
            message: queued.message.clone(),
            publish_time: queued.publish_time,
            delivery_attempt: queued.deliveries,
        };
        sub.outstanding.insert(
            ack_id,
            Outstanding {
                handle_id: self.handle_id,
                queued,
            },
        );
        Some(received)
    }
}

#[async_trait]
impl BrokerSubscription for MemorySubscription {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        loop {
            if self.closed {
                return None;
            }
            if let Some(message) = self.try_take() {
                let acknowledger: Arc<dyn Acknowledger> = self.acknowledger.clone();
                return Some(SubscriptionEvent::Delivery(Delivery::new(
                    message,
                    acknowledger,
                )));
            }
            self.notify.notified().await;
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut state = self.shared.state.lock();
        let sub = state
            .subscriptions
            .get_mut(&self.name)
            .ok_or_else(|| BrokerError::SubscriptionNotFound(self.name.clone()))?;

        let mine: Vec<String> = sub
            .outstanding
            .iter()
            .filter(|(_, o)| o.handle_id == self.handle_id)
            .map(|(ack_id, _)| ack_id.clone())
            .collect();
        for ack_id in &mine {
            if let Some(outstanding) = sub.outstanding.remove(ack_id) {
                sub.queue.push_front(outstanding.queued);
            }
        }
        if !mine.is_empty() {
            sub.notify.notify_one();
        }

        debug!(subscription = %self.name, requeued = mine.len(), "Closed memory subscription");
        Ok(())
    }
}

struct MemoryAcknowledger {
    shared: Arc<Shared>,
    subscription: String,
}

impl MemoryAcknowledger {
    fn settle(&self, ack_id: &str) -> Result<Option<Queued>> {
        let mut state = self.shared.state.lock();
        let sub = state
            .subscriptions
            .get_mut(&self.subscription)
            .ok_or_else(|| BrokerError::SubscriptionNotFound(self.subscription.clone()))?;
        Ok(sub.outstanding.remove(ack_id).map(|o| o.queued))
    }
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(&self, ack_id: &str) -> Result<()> {
        // Settling twice, or after the handle was closed, is a no-op
        self.settle(ack_id)?;
        Ok(())
    }

    async fn nack(&self, ack_id: &str) -> Result<()> {
        let Some(queued) = self.settle(ack_id)? else {
            return Ok(());
        };

        let delay = *self.shared.redelivery_delay.lock();
        if delay.is_zero() {
            self.shared.requeue(&self.subscription, queued);
        } else {
            let shared = Arc::clone(&self.shared);
            let subscription = self.subscription.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                shared.requeue(&subscription, queued);
            });
        }
        Ok(())
    }
}
