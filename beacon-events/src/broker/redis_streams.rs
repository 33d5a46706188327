//! Redis Streams backend
//!
//! Layout under the project namespace `beacon:{project}`:
//!
//! - `beacon:{project}:topics` is a set of declared topic names
//! - `beacon:{project}:topic:{topic}` is the stream holding the topic's messages
//! - each subscription is a consumer group on that stream
//!
//! Acks are `XACK`. A nack leaves the entry in the group's pending list and
//! hands it back to the local reader for redelivery. On attach the reader
//! claims entries other consumers left pending for longer than the claim idle
//! time (`XAUTOCLAIM`), replays entries still pending for this consumer, then
//! reads new ones. The claim is repeated every claim idle period so entries
//! held by a consumer that died later are picked up too. Delivery attempts of
//! replayed entries come from the group's delivery counter (`XPENDING`).
//! Pending entries whose data was trimmed from the stream are acked and dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Client as RedisClient, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Acknowledger, Broker, BrokerSubscription, Delivery, SubscriptionEvent};
use crate::error::{BrokerError, Result};
use crate::message::{Attributes, Message, MessageId, ReceivedMessage};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay after a failed read
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay after repeated failed reads
const MAX_BACKOFF_SECS: u64 = 30;

/// Max length of each topic stream (approximate)
const MAX_STREAM_LENGTH: usize = 10_000;

/// Entries fetched per `XREADGROUP`
const READ_BATCH_SIZE: usize = 100;

/// `XAUTOCLAIM` pages walked per claim pass
const MAX_CLAIM_PAGES: usize = 10;

/// Default idle time after which another consumer's pending entry is claimed
pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(60);

/// Pause between polls when the stream has nothing new
const POLL_INTERVAL: Duration = Duration::from_millis(200);

const EVENT_CHANNEL_CAPACITY: usize = 256;

const PAYLOAD_FIELD: &str = "payload";
const ATTRIBUTES_FIELD: &str = "attributes";
const PUBLISH_TIME_FIELD: &str = "publishTime";

pub struct RedisStreamsBroker {
    conn: ConnectionManager,
    namespace: String,
    consumer: String,
    redelivery_delay: Duration,
    claim_idle: Duration,
}

impl RedisStreamsBroker {
    /// Connect to `url`, keeping every key under the `project_id` namespace
    pub async fn connect(url: &str, project_id: &str, redelivery_delay: Duration) -> Result<Self> {
        let client = RedisClient::open(url)?;
        let conn = with_timeout("connect", ConnectionManager::new(client)).await?;
        info!(endpoint = %url, project = %project_id, "Connected to Redis broker");

        Ok(Self {
            conn,
            namespace: format!("beacon:{project_id}"),
            consumer: format!("consumer-{}", nanoid::nanoid!(8)),
            redelivery_delay,
            claim_idle: DEFAULT_CLAIM_IDLE,
        })
    }

    /// Consumer name used inside every consumer group. A stable name lets a
    /// restarted process pick up its own pending entries.
    #[must_use]
    pub fn with_consumer_name(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// How long an entry must sit unacked in another consumer's pending list
    /// before this consumer takes it over
    #[must_use]
    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        if !claim_idle.is_zero() {
            self.claim_idle = claim_idle;
        }
        self
    }

    fn topics_key(&self) -> String {
        format!("{}:topics", self.namespace)
    }

    fn stream_key(&self, topic: &str) -> String {
        format!("{}:topic:{topic}", self.namespace)
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        with_timeout("SISMEMBER", conn.sismember(self.topics_key(), topic)).await
    }

    async fn create_topic(&self, topic: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let added: usize = with_timeout("SADD", conn.sadd(self.topics_key(), topic)).await?;
        if added > 0 {
            info!(topic = %topic, "Created topic");
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, message: Message) -> Result<MessageId> {
        if !self.topic_exists(topic).await? {
            return Err(BrokerError::TopicNotFound(topic.to_string()));
        }

        let attributes = serde_json::to_vec(&message.attributes)
            .map_err(|e| BrokerError::Codec(format!("Failed to encode attributes: {e}")))?;
        let fields: [(&str, Vec<u8>); 3] = [
            (PAYLOAD_FIELD, message.payload.to_vec()),
            (ATTRIBUTES_FIELD, attributes),
            (PUBLISH_TIME_FIELD, Utc::now().to_rfc3339().into_bytes()),
        ];

        let mut conn = self.conn.clone();
        with_timeout(
            "XADD",
            conn.xadd_maxlen::<_, _, _, _, String>(
                self.stream_key(topic),
                StreamMaxlen::Approx(MAX_STREAM_LENGTH),
                "*",
                &fields,
            ),
        )
        .await
    }

    async fn create_subscription(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<Box<dyn BrokerSubscription>> {
        if !self.topic_exists(topic).await? {
            return Err(BrokerError::TopicNotFound(topic.to_string()));
        }

        let stream = self.stream_key(topic);
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.xgroup_create_mkstream(&stream, name, "$"),
        )
        .await
        .map_err(|_| BrokerError::Timeout("XGROUP CREATE timed out".to_string()))?;

        match created {
            Ok(()) => info!(subscription = %name, topic = %topic, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(subscription = %name, topic = %topic, "Attaching to existing consumer group");
            }
            Err(e) => return Err(e.into()),
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (redeliver_tx, redeliver_rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        let pending = Arc::new(DashMap::new());

        let acknowledger: Arc<dyn Acknowledger> = Arc::new(RedisAcknowledger {
            conn: self.conn.clone(),
            stream: stream.clone(),
            group: name.to_string(),
            pending: Arc::clone(&pending),
            redeliver_tx,
            redelivery_delay: self.redelivery_delay,
        });

        let reader = StreamReader {
            conn: self.conn.clone(),
            stream,
            group: name.to_string(),
            consumer: self.consumer.clone(),
            claim_idle: self.claim_idle,
            pending,
            acknowledger,
            events_tx,
            redeliver_rx,
            cancel: cancel_token.clone(),
        };

        Ok(Box::new(RedisSubscription {
            name: name.to_string(),
            events_rx,
            cancel_token,
            reader: Some(tokio::spawn(reader.run())),
        }))
    }
}

struct RedisSubscription {
    name: String,
    events_rx: mpsc::Receiver<SubscriptionEvent>,
    cancel_token: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

#[async_trait]
impl BrokerSubscription for RedisSubscription {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        self.events_rx.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        self.cancel_token.cancel();
        self.events_rx.close();
        if let Some(reader) = self.reader.take() {
            reader
                .await
                .map_err(|e| BrokerError::backend(format!("Stream reader task failed: {e}")))?;
        }
        debug!(subscription = %self.name, "Closed Redis subscription");
        Ok(())
    }
}

impl Drop for RedisSubscription {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

enum ReadCursor {
    /// Replaying this consumer's pending entries after the given id
    Pending(String),
    New,
}

impl ReadCursor {
    fn id(&self) -> &str {
        match self {
            Self::Pending(id) => id,
            Self::New => ">",
        }
    }
}

struct StreamReader {
    conn: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
    claim_idle: Duration,
    pending: Arc<DashMap<String, ReceivedMessage>>,
    acknowledger: Arc<dyn Acknowledger>,
    events_tx: mpsc::Sender<SubscriptionEvent>,
    redeliver_rx: mpsc::UnboundedReceiver<ReceivedMessage>,
    cancel: CancellationToken,
}

impl StreamReader {
    async fn run(mut self) {
        let mut cursor = ReadCursor::Pending("0".to_string());
        let mut backoff_secs = INITIAL_BACKOFF_SECS;
        let mut next_claim = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            // Redeliveries first so a nacked message is not starved by new traffic
            while let Ok(message) = self.redeliver_rx.try_recv() {
                if !self.emit(message).await {
                    return;
                }
            }

            if Instant::now() >= next_claim {
                next_claim = Instant::now() + self.claim_idle;
                match self.claim_stale().await {
                    Ok(entries) => {
                        if !self.deliver(entries, true).await {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(
                            stream = %self.stream,
                            subscription = %self.group,
                            error = %e,
                            "Failed to claim stale pending entries"
                        );
                        if !self.forward(SubscriptionEvent::Error(e)).await {
                            return;
                        }
                    }
                }
            }

            match self.read_batch(&cursor).await {
                Ok(entries) => {
                    backoff_secs = INITIAL_BACKOFF_SECS;
                    let count = entries.len();
                    let replaying = matches!(cursor, ReadCursor::Pending(_));

                    if replaying {
                        if let Some(last) = entries.last() {
                            cursor = ReadCursor::Pending(last.id.clone());
                        }
                    }
                    if !self.deliver(entries, replaying).await {
                        return;
                    }

                    if replaying && count < READ_BATCH_SIZE {
                        cursor = ReadCursor::New;
                    }
                    if count == 0 && !self.idle(POLL_INTERVAL).await {
                        return;
                    }
                }
                Err(e) => {
                    error!(
                        stream = %self.stream,
                        subscription = %self.group,
                        error = %e,
                        backoff_secs,
                        "Failed to read from stream, retrying"
                    );
                    if !self.forward(SubscriptionEvent::Error(e)).await {
                        return;
                    }
                    if !self.idle(Duration::from_secs(backoff_secs)).await {
                        return;
                    }
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                }
            }
        }
    }

    /// Emit a batch of entries. Entries that were delivered before
    /// (`redelivered`) take their attempt count from the group's delivery
    /// counter. Trimmed entries are acked and dropped. False once the
    /// subscription is gone.
    async fn deliver(&mut self, entries: Vec<StreamId>, redelivered: bool) -> bool {
        if entries.is_empty() {
            return true;
        }

        let counts = if redelivered {
            match self.delivery_counts(&entries).await {
                Ok(counts) => counts,
                Err(e) => {
                    warn!(stream = %self.stream, error = %e, "Failed to read delivery counts");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        let pending = Arc::clone(&self.pending);
        let (messages, trimmed) =
            prepare_batch(entries, &counts, |id| pending.contains_key(id));

        for id in trimmed {
            warn!(
                stream = %self.stream,
                subscription = %self.group,
                entry_id = %id,
                "Pending entry was trimmed from the stream, dropping it"
            );
            if let Err(e) = self.acknowledger.ack(&id).await {
                warn!(entry_id = %id, error = %e, "Failed to ack trimmed entry");
            }
        }

        for message in messages {
            if !self.emit(message).await {
                return false;
            }
        }
        true
    }

    /// Take over entries idle in any consumer's pending list for longer than
    /// `claim_idle`
    async fn claim_stale(&mut self) -> Result<Vec<StreamId>> {
        let min_idle_ms = u64::try_from(self.claim_idle.as_millis()).unwrap_or(u64::MAX);
        let mut start = "0-0".to_string();
        let mut claimed = Vec::new();

        for _ in 0..MAX_CLAIM_PAGES {
            let mut cmd = redis::cmd("XAUTOCLAIM");
            cmd.arg(&self.stream)
                .arg(&self.group)
                .arg(&self.consumer)
                .arg(min_idle_ms)
                .arg(&start)
                .arg("COUNT")
                .arg(READ_BATCH_SIZE);
            let reply: StreamAutoClaimReply =
                with_timeout("XAUTOCLAIM", cmd.query_async(&mut self.conn)).await?;

            if !reply.deleted_ids.is_empty() {
                warn!(
                    stream = %self.stream,
                    subscription = %self.group,
                    count = reply.deleted_ids.len(),
                    "Pending entries were trimmed from the stream before delivery"
                );
            }
            claimed.extend(reply.claimed);

            if reply.next_stream_id == "0-0" {
                break;
            }
            start = reply.next_stream_id;
        }

        if !claimed.is_empty() {
            info!(
                stream = %self.stream,
                subscription = %self.group,
                count = claimed.len(),
                "Claimed stale pending entries"
            );
        }
        Ok(claimed)
    }

    /// Times each entry was delivered, per the group's pending list
    async fn delivery_counts(&mut self, entries: &[StreamId]) -> Result<HashMap<String, usize>> {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return Ok(HashMap::new());
        };

        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(&self.stream)
            .arg(&self.group)
            .arg(&first.id)
            .arg(&last.id)
            .arg(entries.len())
            .arg(&self.consumer);
        let reply: StreamPendingCountReply =
            with_timeout("XPENDING", cmd.query_async(&mut self.conn)).await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|pending| (pending.id, pending.times_delivered))
            .collect())
    }

    async fn read_batch(&mut self, cursor: &ReadCursor) -> Result<Vec<StreamId>> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(READ_BATCH_SIZE);
        let reply: Option<StreamReadReply> = with_timeout(
            "XREADGROUP",
            self.conn
                .xread_options(&[&self.stream], &[cursor.id()], &options),
        )
        .await?;

        Ok(reply
            .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids).collect())
            .unwrap_or_default())
    }

    /// Wait up to `period`, waking early for a redelivery. False once cancelled.
    async fn idle(&mut self, period: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            message = self.redeliver_rx.recv() => match message {
                Some(message) => self.emit(message).await,
                None => true,
            },
            () = tokio::time::sleep(period) => true,
        }
    }

    async fn emit(&mut self, message: ReceivedMessage) -> bool {
        self.pending.insert(message.ack_id.clone(), message.clone());
        let delivery = Delivery::new(message, Arc::clone(&self.acknowledger));
        self.forward(SubscriptionEvent::Delivery(delivery)).await
    }

    async fn forward(&self, event: SubscriptionEvent) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            sent = self.events_tx.send(event) => sent.is_ok(),
        }
    }
}

struct RedisAcknowledger {
    conn: ConnectionManager,
    stream: String,
    group: String,
    pending: Arc<DashMap<String, ReceivedMessage>>,
    redeliver_tx: mpsc::UnboundedSender<ReceivedMessage>,
    redelivery_delay: Duration,
}

#[async_trait]
impl Acknowledger for RedisAcknowledger {
    async fn ack(&self, ack_id: &str) -> Result<()> {
        self.pending.remove(ack_id);
        let mut conn = self.conn.clone();
        let _: usize = with_timeout("XACK", conn.xack(&self.stream, &self.group, &[ack_id])).await?;
        Ok(())
    }

    async fn nack(&self, ack_id: &str) -> Result<()> {
        let Some((_, mut message)) = self.pending.remove(ack_id) else {
            return Ok(());
        };
        message.delivery_attempt += 1;

        let tx = self.redeliver_tx.clone();
        let delay = self.redelivery_delay;
        if delay.is_zero() {
            if tx.send(message).is_err() {
                warn!(ack_id = %ack_id, "Subscription closed, nacked entry stays pending");
            }
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // Closed reader: the entry stays in the pending list for the next attach
                let _ = tx.send(message);
            });
        }
        Ok(())
    }
}

async fn with_timeout<T>(
    operation: &str,
    fut: impl Future<Output = redis::RedisResult<T>>,
) -> Result<T> {
    timeout(Duration::from_secs(REDIS_TIMEOUT_SECS), fut)
        .await
        .map_err(|_| BrokerError::Timeout(format!("{operation} timed out")))?
        .map_err(BrokerError::from)
}

fn field_bytes<'a>(entry: &'a StreamId, field: &str) -> Option<&'a [u8]> {
    match entry.map.get(field)? {
        Value::BulkString(bytes) => Some(bytes.as_slice()),
        Value::SimpleString(s) => Some(s.as_bytes()),
        _ => None,
    }
}

/// Split a batch into messages to emit and ids of trimmed entries.
/// Entries already awaiting settlement locally are skipped.
fn prepare_batch(
    entries: Vec<StreamId>,
    delivery_counts: &HashMap<String, usize>,
    already_pending: impl Fn(&str) -> bool,
) -> (Vec<ReceivedMessage>, Vec<String>) {
    let mut messages = Vec::with_capacity(entries.len());
    let mut trimmed = Vec::new();

    for entry in entries {
        if already_pending(&entry.id) {
            continue;
        }
        if entry.map.is_empty() {
            trimmed.push(entry.id);
            continue;
        }
        let attempt = delivery_counts
            .get(&entry.id)
            .map_or(1, |count| u32::try_from(*count).unwrap_or(u32::MAX).max(1));
        messages.push(decode_entry(entry, attempt));
    }

    (messages, trimmed)
}

/// Stream ids start with the entry's creation time in milliseconds
fn time_from_id(id: &str) -> Option<DateTime<Utc>> {
    let millis = id.split('-').next()?.parse::<i64>().ok()?;
    DateTime::from_timestamp_millis(millis)
}

fn decode_entry(entry: StreamId, delivery_attempt: u32) -> ReceivedMessage {
    let payload = field_bytes(&entry, PAYLOAD_FIELD)
        .map(<[u8]>::to_vec)
        .unwrap_or_default();
    let attributes: Attributes = field_bytes(&entry, ATTRIBUTES_FIELD)
        .and_then(|raw| serde_json::from_slice(raw).ok())
        .unwrap_or_default();
    let publish_time = field_bytes(&entry, PUBLISH_TIME_FIELD)
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
        .or_else(|| time_from_id(&entry.id))
        .unwrap_or_else(Utc::now);

    ReceivedMessage {
        id: entry.id.clone(),
        ack_id: entry.id,
        message: Message {
            payload: payload.into(),
            attributes,
        },
        publish_time,
        delivery_attempt,
    }
}
