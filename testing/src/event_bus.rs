//! In-memory partitioned broker.
//!
//! Models the parts of a Kafka-compatible broker the pipeline relies on:
//!
//! - a fixed number of partitions per topic, chosen by hashing the key
//! - per-partition offsets starting at 0
//! - committed offsets per `(group, topic, partition)`
//! - a new subscription resumes from the committed offsets, so anything
//!   delivered but not committed is delivered again
//! - [`InMemoryEventBus::trigger_rebalance`] revokes and reassigns every
//!   partition of live subscriptions, rewinding them to the committed offsets
//! - a paused partition yields nothing until resumed; a rebalance clears
//!   every pause
//!
//! Every subscription is assigned all partitions of its topic.

use mentor_rating_core::event_bus::{
    BusEvent, ConsumerRecord, Delivery, EventBus, EventBusError, OffsetCommitter, PartitionFlow, Subscription,
};
use std::collections::{HashMap, HashSet};
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};

#[derive(Clone, Debug)]
struct StoredMessage {
    key: Option<String>,
    payload: Option<Vec<u8>>,
}

struct Member {
    group: String,
    topic: String,
    rebalance: mpsc::UnboundedSender<()>,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, Vec<Vec<StoredMessage>>>,
    /// Next offset to deliver per (group, topic, partition).
    committed: HashMap<(String, String, i32), i64>,
    members: Vec<Member>,
    publish_failures_remaining: usize,
    fail_commits: bool,
    delivered: usize,
}

impl BusState {
    fn partitions_mut(&mut self, topic: &str, partition_count: u32) -> &mut Vec<Vec<StoredMessage>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partition_count as usize])
    }

    fn committed_positions(&self, group: &str, topic: &str, partition_count: u32) -> Vec<i64> {
        (0..partition_count)
            .map(|p| {
                let partition = i32::try_from(p).unwrap_or(i32::MAX);
                self.committed
                    .get(&(group.to_string(), topic.to_string(), partition))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    fn fetch(&self, topic: &str, cursors: &mut [i64], paused: &HashSet<i32>) -> Vec<ConsumerRecord> {
        let Some(partitions) = self.topics.get(topic) else {
            return Vec::new();
        };
        let mut batch = Vec::new();
        for (index, log) in partitions.iter().enumerate() {
            if paused.contains(&i32::try_from(index).unwrap_or(i32::MAX)) {
                continue;
            }
            let cursor = &mut cursors[index];
            let start = usize::try_from(*cursor).unwrap_or(0);
            for (position, message) in log.iter().enumerate().skip(start) {
                batch.push(ConsumerRecord {
                    topic: topic.to_string(),
                    partition: i32::try_from(index).unwrap_or(i32::MAX),
                    offset: i64::try_from(position).unwrap_or(i64::MAX),
                    key: message.key.clone(),
                    payload: message.payload.clone(),
                });
            }
            *cursor = i64::try_from(log.len()).unwrap_or(i64::MAX);
        }
        batch
    }
}

/// In-memory broker for tests.
///
/// # Example
///
/// ```
/// use mentor_rating_core::event_bus::EventBus;
/// use mentor_rating_testing::InMemoryEventBus;
///
/// # tokio_test::block_on(async {
/// let bus = InMemoryEventBus::new(3);
/// let first = bus.publish("reviews", "7", b"{}").await.unwrap();
/// let second = bus.publish("reviews", "7", b"{}").await.unwrap();
///
/// assert_eq!(first.partition, second.partition);
/// assert_eq!(second.offset, first.offset + 1);
/// # });
/// ```
#[derive(Clone)]
pub struct InMemoryEventBus {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
    partition_count: u32,
}

impl InMemoryEventBus {
    /// Create a bus whose topics have `partition_count` partitions.
    #[must_use]
    pub fn new(partition_count: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            notify: Arc::new(Notify::new()),
            partition_count: partition_count.max(1),
        }
    }

    /// Number of partitions per topic.
    #[must_use]
    pub const fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Partition a key routes to. Deterministic for the life of the process.
    #[must_use]
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        i32::try_from(hasher.finish() % u64::from(self.partition_count)).unwrap_or(0)
    }

    /// Append a message without going through [`EventBus::publish`].
    ///
    /// Allows arbitrary payloads (including `None`) for malformed-input tests.
    pub fn publish_raw(&self, topic: &str, key: Option<&str>, payload: Option<Vec<u8>>) -> Delivery {
        let partition = key.map_or(0, |k| self.partition_for(k));
        let delivery = {
            let mut state = self.state.lock().unwrap();
            let partitions = state.partitions_mut(topic, self.partition_count);
            let log = &mut partitions[usize::try_from(partition).unwrap_or(0)];
            log.push(StoredMessage {
                key: key.map(str::to_string),
                payload,
            });
            Delivery {
                partition,
                offset: i64::try_from(log.len() - 1).unwrap_or(i64::MAX),
            }
        };
        self.notify.notify_waiters();
        delivery
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().unwrap().publish_failures_remaining = count;
    }

    /// Make every commit fail (simulates a crash between apply and commit).
    pub fn fail_commits(&self, fail: bool) {
        self.state.lock().unwrap().fail_commits = fail;
    }

    /// Revoke and reassign all partitions of every live subscription.
    ///
    /// Subscriptions rewind to the committed offsets, so uncommitted messages
    /// are delivered again.
    pub fn trigger_rebalance(&self) {
        let mut state = self.state.lock().unwrap();
        state.members.retain(|m| m.rebalance.send(()).is_ok());
    }

    /// Every message of `topic`, partition by partition, in offset order.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<ConsumerRecord> {
        let state = self.state.lock().unwrap();
        let mut cursors = vec![0; self.partition_count as usize];
        state.fetch(topic, &mut cursors, &HashSet::new())
    }

    /// Next offset `group` will receive on `partition`, if it committed anything.
    #[must_use]
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .unwrap()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Messages handed out by all subscriptions so far, redeliveries included.
    #[must_use]
    pub fn delivered_count(&self) -> usize {
        self.state.lock().unwrap().delivered
    }

    /// Number of live subscriptions for `group` on `topic`.
    #[must_use]
    pub fn member_count(&self, group: &str, topic: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .members
            .iter()
            .filter(|m| m.group == group && m.topic == topic && !m.rebalance.is_closed())
            .count()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(4)
    }
}

struct InMemoryCommitter {
    state: Arc<Mutex<BusState>>,
    group: String,
}

impl OffsetCommitter for InMemoryCommitter {
    fn commit(&self, record: &ConsumerRecord) -> Result<(), EventBusError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_commits {
            return Err(EventBusError::CommitFailed {
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
                reason: "commits disabled".to_string(),
            });
        }
        let next = state
            .committed
            .entry((self.group.clone(), record.topic.clone(), record.partition))
            .or_insert(0);
        *next = (*next).max(record.offset + 1);
        Ok(())
    }
}

/// Paused partitions of one subscription.
struct InMemoryFlow {
    paused: Arc<Mutex<HashSet<i32>>>,
    notify: Arc<Notify>,
    partition_count: u32,
}

impl InMemoryFlow {
    fn check(&self, partition: i32) -> Result<(), EventBusError> {
        if u32::try_from(partition).is_ok_and(|p| p < self.partition_count) {
            Ok(())
        } else {
            Err(EventBusError::ConsumerGroupError(format!("partition {partition} is not assigned")))
        }
    }
}

impl PartitionFlow for InMemoryFlow {
    fn pause(&self, partition: i32) -> Result<(), EventBusError> {
        self.check(partition)?;
        self.paused.lock().unwrap().insert(partition);
        Ok(())
    }

    fn resume(&self, partition: i32) -> Result<(), EventBusError> {
        self.check(partition)?;
        if self.paused.lock().unwrap().remove(&partition) {
            self.notify.notify_waiters();
        }
        Ok(())
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<Delivery, EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let key = key.to_string();
        let payload = payload.to_vec();

        Box::pin(async move {
            {
                let mut state = self.state.lock().unwrap();
                if state.publish_failures_remaining > 0 {
                    state.publish_failures_remaining -= 1;
                    return Err(EventBusError::PublishFailed {
                        topic,
                        reason: "injected publish failure".to_string(),
                    });
                }
            }
            Ok(self.publish_raw(&topic, Some(&key), Some(payload)))
        })
    }

    fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let group = group.to_string();

        Box::pin(async move {
            let (rebalance_tx, mut rebalance_rx) = mpsc::unbounded_channel();
            let mut cursors = {
                let mut state = self.state.lock().unwrap();
                state.partitions_mut(&topic, self.partition_count);
                state.members.push(Member {
                    group: group.clone(),
                    topic: topic.clone(),
                    rebalance: rebalance_tx,
                });
                state.committed_positions(&group, &topic, self.partition_count)
            };

            let all: Vec<i32> = (0..self.partition_count)
                .map(|p| i32::try_from(p).unwrap_or(i32::MAX))
                .collect();
            let state = Arc::clone(&self.state);
            let notify = Arc::clone(&self.notify);
            let partition_count = self.partition_count;
            let stream_group = group.clone();
            let paused: Arc<Mutex<HashSet<i32>>> = Arc::default();
            let flow = InMemoryFlow {
                paused: Arc::clone(&paused),
                notify: Arc::clone(&notify),
                partition_count,
            };

            let events = async_stream::stream! {
                yield Ok(BusEvent::Assigned(all.clone()));
                let mut rebalance_requested = false;

                'poll: loop {
                    if rebalance_requested || rebalance_rx.try_recv().is_ok() {
                        rebalance_requested = false;
                        yield Ok(BusEvent::Revoked(all.clone()));
                        paused.lock().unwrap().clear();
                        cursors = state
                            .lock()
                            .unwrap()
                            .committed_positions(&stream_group, &topic, partition_count);
                        yield Ok(BusEvent::Assigned(all.clone()));
                    }

                    // Register for wakeups before looking, so a publish in between is not missed.
                    let notified = notify.notified();
                    tokio::pin!(notified);

                    let skip = paused.lock().unwrap().clone();
                    let batch = state.lock().unwrap().fetch(&topic, &mut cursors, &skip);
                    if batch.is_empty() {
                        tokio::select! {
                            () = &mut notified => {}
                            Some(()) = rebalance_rx.recv() => rebalance_requested = true,
                        }
                        continue;
                    }

                    for record in batch {
                        if rebalance_rx.try_recv().is_ok() {
                            rebalance_requested = true;
                            continue 'poll;
                        }
                        // Paused while this batch was being handed out: refetch from here on resume.
                        if paused.lock().unwrap().contains(&record.partition) {
                            let cursor = &mut cursors[usize::try_from(record.partition).unwrap_or(0)];
                            *cursor = (*cursor).min(record.offset);
                            continue;
                        }
                        state.lock().unwrap().delivered += 1;
                        yield Ok(BusEvent::Message(record));
                    }
                }
            };

            tracing::debug!(group = %group, "In-memory subscription created");

            Ok(Subscription {
                events: Box::pin(events),
                committer: Arc::new(InMemoryCommitter {
                    state: Arc::clone(&self.state),
                    group,
                }),
                flow: Arc::new(flow),
            })
        })
    }
}
