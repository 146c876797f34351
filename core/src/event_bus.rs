//! Broker abstraction for review events.
//!
//! This module provides the [`EventBus`] trait: the narrow interface the
//! pipeline needs from an ordered, partitioned, durable log.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Review store   │◄─── Source of truth (committed first)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ publish(topic,  │
//! │   key, payload) │◄─── key = review id → partition
//! └────────┬────────┘
//!          │
//!     ┌────┴────┬─────────┐
//!     ▼         ▼         ▼
//! ┌───────┐ ┌───────┐ ┌───────┐
//! │ P0    │ │ P1    │ │ P2    │   ordered per partition
//! └───┬───┘ └───┬───┘ └───┬───┘
//!     └─────────┼─────────┘
//!               ▼
//!     subscribe(topic, group) ──► BusEvent stream + OffsetCommitter + PartitionFlow
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: a message is redelivered until its offset is committed
//! - **Ordered within partition**: messages sharing a key keep publish order
//! - **Manual commit**: consumers commit only after the message was handled
//! - **Consumer groups**: partitions are divided between the members of a group
//!
//! # Implementations
//!
//! - `InMemoryEventBus` (testing crate) - deterministic partitions, for tests
//! - `RedpandaEventBus` (redpanda crate) - Kafka-compatible, for production

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a topic
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed to subscribe
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to commit a consumed offset
    #[error("Commit failed for {topic}[{partition}]@{offset}: {reason}")]
    CommitFailed {
        /// Topic of the message
        topic: String,
        /// Partition of the message
        partition: i32,
        /// Offset of the message
        offset: i64,
        /// The reason for failure
        reason: String,
    },

    /// Consumer group error
    #[error("Consumer group error: {0}")]
    ConsumerGroupError(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Where a published message landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Partition chosen by the broker from the message key.
    pub partition: i32,
    /// Offset of the message within that partition.
    pub offset: i64,
}

/// A message read from a partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerRecord {
    /// Topic the message was read from
    pub topic: String,
    /// Partition the message was read from
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Message key, if any
    pub key: Option<String>,
    /// Raw payload. `None` for tombstones.
    pub payload: Option<Vec<u8>>,
}

/// Items produced by a subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusEvent {
    /// The group coordinator handed these partitions to this member.
    Assigned(Vec<i32>),
    /// These partitions were taken away; in-flight work on them is abandoned.
    Revoked(Vec<i32>),
    /// A message from an assigned partition.
    Message(ConsumerRecord),
}

/// Stream of subscription events.
///
/// Messages of one partition arrive in offset order. Errors are transient:
/// the stream keeps going after yielding one.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<BusEvent, EventBusError>> + Send>>;

/// Marks messages as consumed for a consumer group.
///
/// Committing offset `n` on a partition means every message up to and
/// including `n` will not be redelivered to the group.
pub trait OffsetCommitter: Send + Sync {
    /// Commit `record` as consumed.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::CommitFailed`] if the broker rejects the commit.
    /// The message may then be redelivered.
    fn commit(&self, record: &ConsumerRecord) -> Result<(), EventBusError>;
}

/// Stops and restarts fetching from single partitions of one membership.
///
/// A paused partition yields no further messages until it is resumed, so a
/// consumer that cannot keep up with one partition stops pulling it from the
/// broker instead of buffering it. Messages already handed out are not
/// recalled. A revocation ends the pause.
pub trait PartitionFlow: Send + Sync {
    /// Stop fetching `partition`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConsumerGroupError`] if the partition is not
    /// assigned to this membership or the broker refuses.
    fn pause(&self, partition: i32) -> Result<(), EventBusError>;

    /// Fetch `partition` again, from the first message not yet handed out.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConsumerGroupError`] if the partition is not
    /// assigned to this membership or the broker refuses.
    fn resume(&self, partition: i32) -> Result<(), EventBusError>;
}

/// An active consumer group membership.
pub struct Subscription {
    /// Assignment changes and messages.
    pub events: EventStream,
    /// Commit handle for the same membership.
    pub committer: Arc<dyn OffsetCommitter>,
    /// Per-partition fetch control for the same membership.
    pub flow: Arc<dyn PartitionFlow>,
}

/// Trait for broker implementations.
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync` so one bus can be shared by
/// request handlers on the producer side.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn EventBus>`).
pub trait EventBus: Send + Sync {
    /// Publish `payload` to `topic`, routed by `key`.
    ///
    /// Resolves once the broker has durably acknowledged the message, so two
    /// sequential calls with the same key are stored in call order.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the broker did not accept the message.
    fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<Delivery, EventBusError>> + Send + '_>>;

    /// Join consumer group `group` on `topic`.
    ///
    /// Delivery resumes from the group's last committed offset on each
    /// partition.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the membership cannot be created.
    fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, EventBusError>> + Send + '_>>;
}
