//! Redpanda / Kafka broker for the mentor rating pipeline.
//!
//! This crate implements the [`EventBus`] trait from `mentor-rating-core` on top
//! of rdkafka, so it works against Redpanda, Apache Kafka or any other
//! Kafka-compatible cluster.
//!
//! # Delivery Semantics
//!
//! **Producer**: durable by default.
//! - `acks=all`: a publish resolves only once every in-sync replica has the message
//! - bounded retries (`message.send.max.retries`, default 3)
//! - one in-flight request per connection, so retries cannot reorder a key
//! - transport-level idempotence, so retries cannot duplicate a message
//!
//! **Consumer**: at-least-once with manual commits.
//! - auto commit is disabled; the subscriber commits each message through the
//!   [`OffsetCommitter`] once it has been handled
//! - messages that were never committed are redelivered to whoever owns the
//!   partition next
//! - partition assignment and revocation are surfaced as
//!   [`BusEvent::Assigned`] / [`BusEvent::Revoked`] from a rebalance-aware
//!   consumer context
//! - a subscriber that falls behind on one partition pauses it through
//!   [`PartitionFlow`] and resumes it once caught up
//!
//! # Example
//!
//! ```no_run
//! use mentor_rating_core::event_bus::{BusEvent, EventBus};
//! use mentor_rating_redpanda::RedpandaEventBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaEventBus::new("localhost:9092")?;
//!
//! bus.publish("reviews", "7", br#"{"action":"created","id":7,"email":"m@x.com","score":4.0}"#)
//!     .await?;
//!
//! let mut subscription = bus.subscribe("reviews", "rating-consumer").await?;
//! while let Some(event) = subscription.events.next().await {
//!     if let BusEvent::Message(record) = event? {
//!         // handle, then:
//!         subscription.committer.commit(&record)?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use mentor_rating_core::event_bus::{
    BusEvent, ConsumerRecord, Delivery, EventBus, EventBusError, EventStream, OffsetCommitter,
    PartitionFlow, Subscription,
};
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_ACKS: &str = "all";
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_MAX_IN_FLIGHT: u32 = 1;
const DEFAULT_BUFFER_SIZE: usize = 1000;
const DEFAULT_OFFSET_RESET: &str = "earliest";

/// Kafka-compatible broker.
///
/// Holds one shared [`FutureProducer`]; every [`subscribe`](EventBus::subscribe)
/// call creates its own consumer-group member.
///
/// # Example
///
/// ```no_run
/// use mentor_rating_redpanda::RedpandaEventBus;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    /// Producer shared by all publishers
    producer: FutureProducer,
    /// Bootstrap servers, reused when creating consumers
    brokers: String,
    /// Producer send timeout
    timeout: Duration,
    /// Capacity of the channel between the consumer task and the subscriber
    buffer_size: usize,
    /// Where a group without committed offsets starts
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Create a bus with the durable default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Bootstrap servers of this bus.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    max_retries: Option<u32>,
    max_in_flight: Option<u32>,
    idempotence: Option<bool>,
    compression: Option<String>,
    timeout: Option<Duration>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Comma-separated broker addresses (e.g. `"localhost:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// How many times the producer retries a failed send.
    ///
    /// Default: 3
    #[must_use]
    pub const fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Maximum unacknowledged requests per connection.
    ///
    /// Default: 1. Values above 1 allow retries to reorder messages of a key.
    #[must_use]
    pub const fn max_in_flight(mut self, max_in_flight: u32) -> Self {
        self.max_in_flight = Some(max_in_flight);
        self
    }

    /// Enable or disable the idempotent producer.
    ///
    /// Default: enabled
    #[must_use]
    pub const fn idempotence(mut self, enabled: bool) -> Self {
        self.idempotence = Some(enabled);
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Messages buffered between the consumer task and the subscriber.
    ///
    /// Default: 1000. Zero is treated as 1.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Where a consumer group without committed offsets starts reading:
    /// `"earliest"`, `"latest"` or `"error"`.
    ///
    /// Default: `"earliest"`
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are not set or the
    /// producer configuration is rejected.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;

        let acks = self.producer_acks.as_deref().unwrap_or(DEFAULT_ACKS);
        let max_retries = self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
        let max_in_flight = self.max_in_flight.unwrap_or(DEFAULT_MAX_IN_FLIGHT);
        let idempotence = self.idempotence.unwrap_or(true);
        let compression = self.compression.as_deref().unwrap_or("none");
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("message.send.max.retries", max_retries.to_string())
            .set("max.in.flight.requests.per.connection", max_in_flight.to_string())
            .set("enable.idempotence", idempotence.to_string())
            .set("compression.type", compression)
            .create()
            .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| DEFAULT_OFFSET_RESET.to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            max_retries,
            max_in_flight,
            idempotence,
            compression,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaEventBus created"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout,
            buffer_size,
            auto_offset_reset,
        })
    }
}

/// Consumer context that reports rebalances to the subscription stream.
///
/// librdkafka invokes the callbacks while the consumer is being polled, so the
/// forwarding task drains the channel before forwarding the next message.
struct RebalanceContext {
    tx: mpsc::UnboundedSender<BusEvent>,
}

fn partitions_of(list: &TopicPartitionList) -> Vec<i32> {
    let mut partitions: Vec<i32> = list.elements().iter().map(|e| e.partition()).collect();
    partitions.sort_unstable();
    partitions
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(list) = rebalance {
            let partitions = partitions_of(list);
            tracing::info!(partitions = ?partitions, "Partitions revoked");
            let _ = self.tx.send(BusEvent::Revoked(partitions));
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(list) => {
                let partitions = partitions_of(list);
                tracing::info!(partitions = ?partitions, "Partitions assigned");
                let _ = self.tx.send(BusEvent::Assigned(partitions));
            },
            Rebalance::Error(e) => {
                tracing::warn!(error = %e, "Rebalance failed");
            },
            Rebalance::Revoke(_) => {},
        }
    }
}

type GroupConsumer = StreamConsumer<RebalanceContext>;

/// Commits offsets for one consumer-group member.
struct KafkaCommitter {
    consumer: Arc<GroupConsumer>,
}

impl OffsetCommitter for KafkaCommitter {
    fn commit(&self, record: &ConsumerRecord) -> Result<(), EventBusError> {
        let commit_failed = |reason: String| EventBusError::CommitFailed {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            reason,
        };

        // The committed offset is the next one to read.
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .map_err(|e| commit_failed(e.to_string()))?;

        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(|e| commit_failed(e.to_string()))?;

        tracing::trace!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "Offset committed"
        );
        Ok(())
    }
}

/// Pauses and resumes fetching for one consumer-group member.
struct KafkaFlow {
    consumer: Arc<GroupConsumer>,
    topic: String,
}

impl KafkaFlow {
    fn partition_list(&self, partition: i32) -> TopicPartitionList {
        let mut list = TopicPartitionList::new();
        list.add_partition(&self.topic, partition);
        list
    }
}

impl PartitionFlow for KafkaFlow {
    fn pause(&self, partition: i32) -> Result<(), EventBusError> {
        self.consumer
            .pause(&self.partition_list(partition))
            .map_err(|e| EventBusError::ConsumerGroupError(format!("Failed to pause partition {partition}: {e}")))?;
        tracing::debug!(topic = %self.topic, partition, "Partition paused");
        Ok(())
    }

    fn resume(&self, partition: i32) -> Result<(), EventBusError> {
        self.consumer
            .resume(&self.partition_list(partition))
            .map_err(|e| EventBusError::ConsumerGroupError(format!("Failed to resume partition {partition}: {e}")))?;
        tracing::debug!(topic = %self.topic, partition, "Partition resumed");
        Ok(())
    }
}

fn to_record(message: &impl Message) -> ConsumerRecord {
    ConsumerRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
        payload: message.payload().map(<[u8]>::to_vec),
    }
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<Delivery, EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let key = key.to_string();
        let payload = payload.to_vec();
        let timeout = self.timeout;

        Box::pin(async move {
            let record = FutureRecord::to(&topic).payload(&payload).key(&key);

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        key = %key,
                        partition,
                        offset,
                        "Message published"
                    );
                    Ok(Delivery { partition, offset })
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %topic,
                        key = %key,
                        error = %kafka_error,
                        "Failed to publish message"
                    );
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let group = group.to_string();
        let brokers = self.brokers.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            let (rebalance_tx, mut rebalance_rx) = mpsc::unbounded_channel();

            let consumer: GroupConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create_with_context(RebalanceContext { tx: rebalance_tx })
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topic: topic.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            consumer
                .subscribe(&[topic.as_str()])
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topic: topic.clone(),
                    reason: format!("Failed to subscribe: {e}"),
                })?;

            tracing::info!(
                topic = %topic,
                group = %group,
                buffer_size,
                auto_offset_reset = %auto_offset_reset,
                manual_commit = true,
                "Subscribed to topic"
            );

            let consumer = Arc::new(consumer);
            let (tx, rx) = mpsc::channel(buffer_size);

            let task_consumer = Arc::clone(&consumer);
            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = task_consumer.stream();

                loop {
                    tokio::select! {
                        biased;

                        Some(event) = rebalance_rx.recv() => {
                            if tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }

                        next = stream.next() => {
                            let Some(result) = next else { break };

                            // Rebalance callbacks fired during this poll come first.
                            let mut closed = false;
                            while let Ok(event) = rebalance_rx.try_recv() {
                                if tx.send(Ok(event)).await.is_err() {
                                    closed = true;
                                    break;
                                }
                            }
                            if closed {
                                break;
                            }

                            let item = match result {
                                Ok(message) => {
                                    let record = to_record(&message);
                                    tracing::trace!(
                                        topic = %record.topic,
                                        partition = record.partition,
                                        offset = record.offset,
                                        "Received message"
                                    );
                                    Ok(BusEvent::Message(record))
                                },
                                Err(e) => Err(EventBusError::TransportError(format!(
                                    "Failed to receive message: {e}"
                                ))),
                            };

                            if tx.send(item).await.is_err() {
                                tracing::debug!("Subscriber dropped, exiting consumer task");
                                break;
                            }
                        }
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let events = async_stream::stream! {
                let mut rx = rx;
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };

            Ok(Subscription {
                events: Box::pin(events) as EventStream,
                committer: Arc::new(KafkaCommitter {
                    consumer: Arc::clone(&consumer),
                }) as Arc<dyn OffsetCommitter>,
                flow: Arc::new(KafkaFlow { consumer, topic }) as Arc<dyn PartitionFlow>,
            })
        })
    }
}
