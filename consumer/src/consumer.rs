//! The review event consumer.
//!
//! Joins a consumer group, runs one sequential worker per assigned
//! partition and keeps its [`ConsumerState`] observable. Each worker has a
//! bounded queue; a partition whose worker falls behind is paused at the
//! broker until the worker catches up.
//!
//! # Example
//!
//! ```no_run
//! use mentor_rating_consumer::{PoisonPolicy, ReviewEventConsumer};
//! use mentor_rating_core::event_bus::EventBus;
//! use mentor_rating_core::rpc::RatingApplier;
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! # async fn example(bus: Arc<dyn EventBus>, applier: Arc<dyn RatingApplier>) -> Result<(), Box<dyn std::error::Error>> {
//! let consumer = ReviewEventConsumer::builder()
//!     .bus(bus)
//!     .applier(applier)
//!     .topic("reviews")
//!     .group("rating-consumer")
//!     .poison_policy(PoisonPolicy::DeadLetter { max_attempts: 5 })
//!     .build()?;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let mut ready = consumer.ready();
//! tokio::spawn(async move {
//!     ready.wait().await;
//!     // ... serve readiness, later:
//!     shutdown_tx.send_replace(true);
//! });
//!
//! consumer.run(shutdown_rx).await?;
//! # Ok(())
//! # }
//! ```

use crate::dead_letter::LoggingDeadLetterSink;
use crate::error::ConsumerError;
use crate::retry::RetryPolicy;
use crate::shutdown::cancelled;
use crate::state::ConsumerState;
use crate::worker::{PartitionWorker, PoisonPolicy, WorkerContext};
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use mentor_rating_core::dead_letter::DeadLetterSink;
use mentor_rating_core::event_bus::{
    BusEvent, ConsumerRecord, EventBus, EventBusError, PartitionFlow, Subscription,
};
use mentor_rating_core::rpc::RatingApplier;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Messages queued for one partition worker before its partition is paused.
pub const DEFAULT_PARTITION_BUFFER: usize = 64;

/// Fires once, on the first partition assignment of a run.
#[derive(Clone, Debug)]
pub struct ReadySignal {
    receiver: watch::Receiver<bool>,
}

impl ReadySignal {
    /// Wait until the consumer is ready.
    ///
    /// Returns `false` if the consumer was dropped before becoming ready.
    pub async fn wait(&mut self) -> bool {
        self.receiver.wait_for(|ready| *ready).await.is_ok()
    }

    /// Whether the consumer has become ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.receiver.borrow()
    }
}

struct WorkerHandle {
    messages: mpsc::Sender<ConsumerRecord>,
    task: JoinHandle<()>,
    /// Received from the broker but not yet accepted by the worker queue.
    backlog: VecDeque<ConsumerRecord>,
    generation: u64,
    paused: bool,
    waiting: bool,
}

type Capacity = (i32, u64, Result<mpsc::OwnedPermit<ConsumerRecord>, SendError<()>>);

/// Routes messages to partition workers and keeps each worker queue bounded.
///
/// A message that does not fit into its worker queue is held back and the
/// partition is paused at the broker, so at most the messages the broker had
/// already handed out are held. The partition is resumed once the backlog has
/// moved into the queue.
struct Dispatcher {
    context: WorkerContext,
    flow: Arc<dyn PartitionFlow>,
    shutdown: watch::Receiver<bool>,
    buffer: usize,
    workers: HashMap<i32, WorkerHandle>,
    capacity: FuturesUnordered<BoxFuture<'static, Capacity>>,
    next_generation: u64,
}

impl Dispatcher {
    fn ensure_worker(&mut self, partition: i32) {
        if !self.workers.contains_key(&partition) {
            let worker = self.spawn_worker(partition, VecDeque::new(), false);
            self.workers.insert(partition, worker);
        }
    }

    fn spawn_worker(&mut self, partition: i32, backlog: VecDeque<ConsumerRecord>, paused: bool) -> WorkerHandle {
        let (messages, receiver) = mpsc::channel(self.buffer);
        let worker = PartitionWorker::new(partition, self.context.clone());
        let task = tokio::spawn(worker.run(receiver, self.shutdown.clone()));
        self.next_generation += 1;
        WorkerHandle {
            messages,
            task,
            backlog,
            generation: self.next_generation,
            paused,
            waiting: false,
        }
    }

    fn deliver(&mut self, record: ConsumerRecord) {
        let partition = record.partition;
        self.ensure_worker(partition);
        if let Some(worker) = self.workers.get_mut(&partition) {
            worker.backlog.push_back(record);
        }
        self.flush(partition);
    }

    /// Move backlog into the worker queue, pausing or resuming the partition.
    fn flush(&mut self, partition: i32) {
        loop {
            let Some(worker) = self.workers.get_mut(&partition) else { return };

            let mut closed = false;
            while let Some(record) = worker.backlog.pop_front() {
                match worker.messages.try_send(record) {
                    Ok(()) => {},
                    Err(TrySendError::Full(record)) => {
                        worker.backlog.push_front(record);
                        break;
                    },
                    Err(TrySendError::Closed(record)) => {
                        worker.backlog.push_front(record);
                        closed = true;
                        break;
                    },
                }
            }

            if closed {
                tracing::warn!(partition, "Partition worker gone, restarting it");
                self.restart(partition);
                continue;
            }

            if worker.backlog.is_empty() {
                if worker.paused {
                    worker.paused = false;
                    match self.flow.resume(partition) {
                        Ok(()) => tracing::debug!(partition, "Partition caught up, resumed"),
                        Err(e) => tracing::warn!(partition, error = %e, "Failed to resume partition"),
                    }
                }
                return;
            }

            if !worker.paused {
                worker.paused = true;
                match self.flow.pause(partition) {
                    Ok(()) => tracing::debug!(partition, backlog = worker.backlog.len(), "Partition queue full, paused"),
                    Err(e) => tracing::warn!(partition, error = %e, "Failed to pause partition"),
                }
            }
            if !worker.waiting {
                worker.waiting = true;
                let (generation, sender) = (worker.generation, worker.messages.clone());
                self.capacity
                    .push(Box::pin(async move { (partition, generation, sender.reserve_owned().await) }));
            }
            return;
        }
    }

    /// A worker queue that was full has room again.
    fn on_capacity(&mut self, (partition, generation, permit): Capacity) {
        let Some(worker) = self.workers.get_mut(&partition) else { return };
        if worker.generation != generation {
            return;
        }
        worker.waiting = false;
        if let Ok(permit) = permit {
            if let Some(record) = worker.backlog.pop_front() {
                permit.send(record);
            }
        }
        self.flush(partition);
    }

    fn restart(&mut self, partition: i32) {
        let Some(old) = self.workers.remove(&partition) else { return };
        old.task.abort();
        let worker = self.spawn_worker(partition, old.backlog, old.paused);
        self.workers.insert(partition, worker);
    }

    fn revoke(&mut self, partition: i32) {
        if let Some(worker) = self.workers.remove(&partition) {
            worker.task.abort();
        }
    }

    /// Records held back from the worker queues.
    fn held_back(&self) -> usize {
        self.workers.values().map(|w| w.backlog.len()).sum()
    }

    fn partitions(&self) -> Vec<i32> {
        let mut partitions: Vec<i32> = self.workers.keys().copied().collect();
        partitions.sort_unstable();
        partitions
    }
}

enum Step {
    Shutdown,
    Capacity(Capacity),
    Bus(Option<Result<BusEvent, EventBusError>>),
}

/// Consumes review events and applies them through a [`RatingApplier`].
pub struct ReviewEventConsumer {
    bus: Arc<dyn EventBus>,
    applier: Arc<dyn RatingApplier>,
    dead_letters: Arc<dyn DeadLetterSink>,
    topic: String,
    group: String,
    poison_policy: PoisonPolicy,
    retry_policy: RetryPolicy,
    partition_buffer: usize,
    state: watch::Sender<ConsumerState>,
    ready: watch::Sender<bool>,
}

impl ReviewEventConsumer {
    /// Create a new consumer builder.
    #[must_use]
    pub fn builder() -> ReviewEventConsumerBuilder {
        ReviewEventConsumerBuilder::default()
    }

    /// Subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer group id.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Watch the consumer state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Readiness gate.
    #[must_use]
    pub fn ready(&self) -> ReadySignal {
        ReadySignal {
            receiver: self.ready.subscribe(),
        }
    }

    /// Consume until `shutdown` carries `true`.
    ///
    /// On shutdown every worker finishes the message it is handling, the
    /// subscription is dropped and the state ends at [`ConsumerState::Stopped`].
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::Subscribe`] if the group cannot be joined
    /// - [`ConsumerError::SubscriptionClosed`] if the broker stream ends on its own
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        self.state.send_replace(ConsumerState::Joining);

        let Subscription {
            mut events,
            committer,
            flow,
        } = match self.bus.subscribe(&self.topic, &self.group).await {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!(topic = %self.topic, group = %self.group, error = %e, "Failed to join consumer group");
                self.state.send_replace(ConsumerState::Stopped);
                return Err(e.into());
            },
        };
        tracing::info!(topic = %self.topic, group = %self.group, "Joined consumer group");

        let mut dispatcher = Dispatcher {
            context: WorkerContext {
                applier: Arc::clone(&self.applier),
                dead_letters: Arc::clone(&self.dead_letters),
                committer,
                poison_policy: self.poison_policy,
                retry_policy: self.retry_policy.clone(),
            },
            flow,
            shutdown: shutdown.clone(),
            buffer: self.partition_buffer,
            workers: HashMap::new(),
            capacity: FuturesUnordered::new(),
            next_generation: 0,
        };

        let outcome = loop {
            let step = tokio::select! {
                biased;
                () = cancelled(&mut shutdown) => Step::Shutdown,
                Some(capacity) = dispatcher.capacity.next(), if !dispatcher.capacity.is_empty() => {
                    Step::Capacity(capacity)
                },
                next = events.next() => Step::Bus(next),
            };

            match step {
                Step::Shutdown => break Ok(()),
                Step::Capacity(capacity) => dispatcher.on_capacity(capacity),
                Step::Bus(Some(Ok(BusEvent::Assigned(partitions)))) => {
                    tracing::info!(partitions = ?partitions, "Partitions assigned");
                    for partition in partitions {
                        dispatcher.ensure_worker(partition);
                    }
                    if !*self.ready.borrow() {
                        self.state.send_replace(ConsumerState::Ready);
                        self.ready.send_replace(true);
                    }
                    self.state.send_replace(ConsumerState::Consuming {
                        partitions: dispatcher.partitions(),
                    });
                },
                Step::Bus(Some(Ok(BusEvent::Revoked(partitions)))) => {
                    tracing::info!(partitions = ?partitions, "Partitions revoked");
                    for partition in partitions {
                        dispatcher.revoke(partition);
                    }
                    if dispatcher.workers.is_empty() {
                        self.state.send_replace(ConsumerState::Joining);
                    } else {
                        self.state.send_replace(ConsumerState::Consuming {
                            partitions: dispatcher.partitions(),
                        });
                    }
                },
                Step::Bus(Some(Ok(BusEvent::Message(record)))) => dispatcher.deliver(record),
                Step::Bus(Some(Err(e))) => {
                    tracing::warn!(topic = %self.topic, error = %e, "Broker error, continuing");
                },
                Step::Bus(None) => {
                    if *shutdown.borrow() {
                        break Ok(());
                    }
                    break Err(ConsumerError::SubscriptionClosed {
                        topic: self.topic.clone(),
                    });
                },
            }
        };

        // Held-back messages were never handed to a worker and stay uncommitted.
        let held_back = dispatcher.held_back();
        let Dispatcher { workers, capacity, .. } = dispatcher;
        drop(capacity);
        if outcome.is_ok() {
            tracing::debug!(held_back, "Leaving held-back messages for redelivery");
            self.drain(workers).await;
        } else {
            for worker in workers.into_values() {
                worker.task.abort();
            }
        }

        drop(events);
        self.state.send_replace(ConsumerState::Stopped);
        tracing::info!(topic = %self.topic, group = %self.group, "Consumer stopped");
        outcome
    }

    async fn drain(&self, workers: HashMap<i32, WorkerHandle>) {
        self.state.send_replace(ConsumerState::Draining);
        tracing::info!(workers = workers.len(), "Draining partition workers");

        let tasks: Vec<_> = workers
            .into_iter()
            .map(|(partition, worker)| {
                drop(worker.messages);
                (partition, worker.task)
            })
            .collect();

        for (partition, task) in tasks {
            if let Err(e) = task.await {
                tracing::warn!(partition, error = %e, "Partition worker ended abnormally");
            }
        }
    }
}

/// Builder for [`ReviewEventConsumer`].
#[derive(Default)]
pub struct ReviewEventConsumerBuilder {
    bus: Option<Arc<dyn EventBus>>,
    applier: Option<Arc<dyn RatingApplier>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    topic: Option<String>,
    group: Option<String>,
    poison_policy: PoisonPolicy,
    retry_policy: RetryPolicy,
    partition_buffer: Option<usize>,
}

impl ReviewEventConsumerBuilder {
    /// Broker to consume from (required).
    #[must_use]
    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Where decoded events are applied (required).
    #[must_use]
    pub fn applier(mut self, applier: Arc<dyn RatingApplier>) -> Self {
        self.applier = Some(applier);
        self
    }

    /// Dead-letter sink (default: [`LoggingDeadLetterSink`]).
    #[must_use]
    pub fn dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Topic to subscribe to (required).
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Consumer group id (required).
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Poison message handling (default: [`PoisonPolicy::Block`]).
    #[must_use]
    pub const fn poison_policy(mut self, policy: PoisonPolicy) -> Self {
        self.poison_policy = policy;
        self
    }

    /// Backoff between apply attempts.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Messages queued per partition worker before the partition is paused
    /// (default: [`DEFAULT_PARTITION_BUFFER`], at least 1).
    #[must_use]
    pub const fn partition_buffer(mut self, messages: usize) -> Self {
        self.partition_buffer = Some(messages);
        self
    }

    /// Build the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::MissingComponent`] if the bus, applier, topic
    /// or group is missing.
    pub fn build(self) -> Result<ReviewEventConsumer, ConsumerError> {
        let (state, _) = watch::channel(ConsumerState::Joining);
        let (ready, _) = watch::channel(false);

        Ok(ReviewEventConsumer {
            bus: self.bus.ok_or(ConsumerError::MissingComponent("bus"))?,
            applier: self.applier.ok_or(ConsumerError::MissingComponent("applier"))?,
            dead_letters: self
                .dead_letters
                .unwrap_or_else(|| Arc::new(LoggingDeadLetterSink)),
            topic: self.topic.ok_or(ConsumerError::MissingComponent("topic"))?,
            group: self.group.ok_or(ConsumerError::MissingComponent("group"))?,
            poison_policy: self.poison_policy,
            retry_policy: self.retry_policy,
            partition_buffer: self.partition_buffer.unwrap_or(DEFAULT_PARTITION_BUFFER).max(1),
            state,
            ready,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mentor_rating_testing::InMemoryEventBus;

    #[test]
    fn build_requires_collaborators() {
        let err = ReviewEventConsumer::builder().topic("reviews").group("g").build().err().unwrap();
        assert_eq!(err, ConsumerError::MissingComponent("bus"));
    }

    #[tokio::test]
    async fn new_consumer_is_joining_and_not_ready() {
        struct NoApplier;
        impl RatingApplier for NoApplier {
            fn apply(
                &self,
                _request: mentor_rating_core::rpc::RatingRequest,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = Result<(), mentor_rating_core::rpc::RpcError>> + Send + '_>,
            > {
                Box::pin(async { Ok(()) })
            }
        }

        let consumer = ReviewEventConsumer::builder()
            .bus(Arc::new(InMemoryEventBus::new(1)))
            .applier(Arc::new(NoApplier))
            .topic("reviews")
            .group("g")
            .build()
            .unwrap();

        assert_eq!(*consumer.state().borrow(), ConsumerState::Joining);
        assert!(!consumer.ready().is_ready());
        assert_eq!(consumer.topic(), "reviews");
        assert_eq!(consumer.group(), "g");
    }
}
