//! End-to-end tests of the consume → apply → commit path.
//!
//! The broker, aggregate store and dead-letter sink are the in-memory doubles;
//! the applier is the real aggregate service called in-process.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

use mentor_rating_consumer::{
    ConsumerError, ConsumerState, DEFAULT_PARTITION_BUFFER, PoisonPolicy, ReadySignal, RetryPolicy,
    ReviewEventConsumer,
};
use mentor_rating_core::event::ReviewEvent;
use mentor_rating_core::event_bus::EventBus;
use mentor_rating_service::AggregateService;
use mentor_rating_testing::{InMemoryAggregateStore, InMemoryDeadLetterSink, InMemoryEventBus, init_test_tracing};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const TOPIC: &str = "reviews";
const GROUP: &str = "rating-consumer";
const MENTOR: &str = "mentor@x.com";

struct Pipeline {
    bus: InMemoryEventBus,
    store: InMemoryAggregateStore,
    dead_letters: InMemoryDeadLetterSink,
}

struct Running {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ConsumerState>,
    ready: ReadySignal,
    task: JoinHandle<Result<(), ConsumerError>>,
}

impl Running {
    async fn stop(self) -> Result<(), ConsumerError> {
        self.shutdown.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("consumer should stop")
            .expect("consumer task should not panic")
    }
}

impl Pipeline {
    fn new(partitions: u32) -> Self {
        init_test_tracing();
        let store = InMemoryAggregateStore::new();
        store.insert_mentor(MENTOR, "@mentor");
        Self {
            bus: InMemoryEventBus::new(partitions),
            store,
            dead_letters: InMemoryDeadLetterSink::new(),
        }
    }

    fn start(&self, policy: PoisonPolicy) -> Running {
        self.start_with_buffer(policy, DEFAULT_PARTITION_BUFFER)
    }

    fn start_with_buffer(&self, policy: PoisonPolicy, partition_buffer: usize) -> Running {
        let service = AggregateService::new(Arc::new(self.store.clone()));
        let consumer = ReviewEventConsumer::builder()
            .bus(Arc::new(self.bus.clone()))
            .applier(Arc::new(service))
            .dead_letters(Arc::new(self.dead_letters.clone()))
            .topic(TOPIC)
            .group(GROUP)
            .poison_policy(policy)
            .partition_buffer(partition_buffer)
            .retry_policy(
                RetryPolicy::builder()
                    .initial_delay(Duration::from_millis(5))
                    .max_delay(Duration::from_millis(20))
                    .build(),
            )
            .build()
            .unwrap();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = consumer.state();
        let ready = consumer.ready();
        let task = tokio::spawn(async move { consumer.run(shutdown_rx).await });

        Running {
            shutdown,
            state,
            ready,
            task,
        }
    }

    async fn publish(&self, event: ReviewEvent) {
        let payload = event.to_json().unwrap();
        self.bus
            .publish(TOPIC, &event.partition_key(), &payload)
            .await
            .unwrap();
    }

    fn committed(&self, key: &str) -> Option<i64> {
        self.bus
            .committed_offset(GROUP, TOPIC, self.bus.partition_for(key))
    }
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn review_seven_create_edit_delete() {
    let pipeline = Pipeline::new(4);
    let consumer = pipeline.start(PoisonPolicy::default());

    pipeline.publish(ReviewEvent::created(7, MENTOR, 4.0).with_seq(2)).await;
    eventually("create applied", || pipeline.store.totals(MENTOR) == (4.0, 1)).await;

    pipeline.publish(ReviewEvent::deleted(7, MENTOR, 4.0).with_seq(3)).await;
    pipeline.publish(ReviewEvent::updated(7, MENTOR, 2.0).with_seq(4)).await;
    eventually("edit applied", || pipeline.committed("7") == Some(3)).await;
    assert_eq!(pipeline.store.totals(MENTOR), (2.0, 1));

    pipeline.publish(ReviewEvent::deleted(7, MENTOR, 2.0).with_seq(5)).await;
    eventually("delete applied", || pipeline.committed("7") == Some(4)).await;
    assert_eq!(pipeline.store.totals(MENTOR), (0.0, 0));

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_payloads_are_committed_and_skipped() {
    let pipeline = Pipeline::new(2);
    let consumer = pipeline.start(PoisonPolicy::default());

    pipeline.bus.publish_raw(TOPIC, Some("7"), Some(b"{not json".to_vec()));
    pipeline.bus.publish_raw(TOPIC, Some("7"), None);
    pipeline.bus.publish_raw(
        TOPIC,
        Some("7"),
        Some(br#"{"action":"upvoted","id":7,"email":"mentor@x.com","score":5.0}"#.to_vec()),
    );
    pipeline.publish(ReviewEvent::created(7, MENTOR, 4.0)).await;

    eventually("all four committed", || pipeline.committed("7") == Some(4)).await;
    assert_eq!(pipeline.store.totals(MENTOR), (4.0, 1));
    assert_eq!(pipeline.store.apply_calls(), 1);
    assert!(pipeline.dead_letters.is_empty());

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn crash_before_commit_double_counts_events_without_sequence() {
    let pipeline = Pipeline::new(1);
    pipeline.bus.fail_commits(true);

    let first = pipeline.start(PoisonPolicy::default());
    pipeline.publish(ReviewEvent::created(7, MENTOR, 4.0)).await;
    eventually("first apply", || pipeline.store.apply_calls() == 1).await;
    first.stop().await.unwrap();

    pipeline.bus.fail_commits(false);
    let second = pipeline.start(PoisonPolicy::default());
    eventually("redelivery committed", || pipeline.committed("7") == Some(1)).await;

    // Known gap: the aggregate counts the same review twice.
    assert_eq!(pipeline.store.totals(MENTOR), (8.0, 2));
    second.stop().await.unwrap();
}

#[tokio::test]
async fn crash_before_commit_is_deduplicated_with_sequence() {
    let pipeline = Pipeline::new(1);
    pipeline.bus.fail_commits(true);

    let first = pipeline.start(PoisonPolicy::default());
    pipeline.publish(ReviewEvent::created(7, MENTOR, 4.0).with_seq(2)).await;
    eventually("first apply", || pipeline.store.apply_calls() == 1).await;
    first.stop().await.unwrap();

    pipeline.bus.fail_commits(false);
    let second = pipeline.start(PoisonPolicy::default());
    eventually("redelivery committed", || pipeline.committed("7") == Some(1)).await;

    assert_eq!(pipeline.store.apply_calls(), 2);
    assert_eq!(pipeline.store.totals(MENTOR), (4.0, 1));
    second.stop().await.unwrap();
}

#[tokio::test]
async fn transient_failures_are_retried_in_place() {
    let pipeline = Pipeline::new(2);
    pipeline.store.fail_next_applies(2);
    let consumer = pipeline.start(PoisonPolicy::default());

    pipeline.publish(ReviewEvent::created(7, MENTOR, 4.0)).await;

    eventually("applied after retries", || pipeline.committed("7") == Some(1)).await;
    assert_eq!(pipeline.store.apply_calls(), 3);
    assert_eq!(pipeline.store.totals(MENTOR), (4.0, 1));
    assert!(pipeline.dead_letters.is_empty());

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn default_policy_rides_out_an_outage_longer_than_the_backoff() {
    let pipeline = Pipeline::new(1);
    let consumer = pipeline.start(PoisonPolicy::default());

    pipeline.publish(ReviewEvent::created(1, MENTOR, 3.0).with_seq(2)).await;
    eventually("first review applied", || pipeline.store.totals(MENTOR) == (3.0, 1)).await;

    pipeline.store.fail_next_applies(12);
    pipeline.publish(ReviewEvent::created(7, MENTOR, 4.0).with_seq(2)).await;
    eventually("applied once the service is back", || pipeline.committed("7") == Some(2)).await;
    assert_eq!(pipeline.store.apply_calls(), 14);
    assert_eq!(pipeline.store.totals(MENTOR), (7.0, 2));
    assert!(pipeline.dead_letters.is_empty());

    pipeline.publish(ReviewEvent::deleted(7, MENTOR, 4.0).with_seq(3)).await;
    pipeline.publish(ReviewEvent::updated(7, MENTOR, 2.0).with_seq(4)).await;
    eventually("edit applied", || pipeline.committed("7") == Some(4)).await;
    assert_eq!(pipeline.store.totals(MENTOR), (5.0, 2));

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn transport_failures_do_not_use_up_the_dead_letter_budget() {
    let pipeline = Pipeline::new(1);
    pipeline.store.fail_next_applies(6);
    let consumer = pipeline.start(PoisonPolicy::DeadLetter { max_attempts: 3 });

    pipeline.publish(ReviewEvent::created(7, MENTOR, 4.0)).await;

    eventually("applied after the outage", || pipeline.committed("7") == Some(1)).await;
    assert_eq!(pipeline.store.apply_calls(), 7);
    assert_eq!(pipeline.store.totals(MENTOR), (4.0, 1));
    assert!(pipeline.dead_letters.is_empty());

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn blocked_partition_is_paused_instead_of_buffered() {
    let pipeline = Pipeline::new(1);
    pipeline.store.fail_next_applies(usize::MAX);
    let consumer = pipeline.start_with_buffer(PoisonPolicy::Block, 2);

    for review_id in 0..40 {
        pipeline.publish(ReviewEvent::created(review_id, MENTOR, 1.0)).await;
    }
    eventually("head of line retried", || pipeline.store.apply_calls() >= 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // One message in flight, two queued, one held back.
    let pulled = pipeline.bus.delivered_count();
    assert!(pulled <= 4, "pulled {pulled} messages from a blocked partition");
    assert_eq!(pipeline.committed("0"), None);

    pipeline.store.fail_next_applies(0);
    eventually("partition resumed and drained", || pipeline.committed("0") == Some(40)).await;
    assert_eq!(pipeline.store.totals(MENTOR), (40.0, 40));
    assert_eq!(pipeline.bus.delivered_count(), 40);

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn poison_message_is_dead_lettered_and_partition_moves_on() {
    let pipeline = Pipeline::new(2);
    let consumer = pipeline.start(PoisonPolicy::DeadLetter { max_attempts: 3 });

    pipeline.publish(ReviewEvent::created(7, "ghost@x.com", 5.0)).await;
    pipeline.publish(ReviewEvent::created(7, MENTOR, 4.0)).await;

    eventually("both committed", || pipeline.committed("7") == Some(2)).await;

    let letters = pipeline.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 3);
    assert_eq!(letters[0].record.offset, 0);
    assert_eq!(letters[0].record.key.as_deref(), Some("7"));
    assert!(letters[0].error_message.contains("ghost@x.com"));
    assert!(letters[0].first_failed_at <= letters[0].last_failed_at);

    let parked = ReviewEvent::from_json(letters[0].record.payload.as_deref().unwrap()).unwrap();
    assert_eq!(parked.mentor_email, "ghost@x.com");
    assert_eq!(pipeline.store.totals(MENTOR), (4.0, 1));

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn block_policy_holds_the_partition_until_the_apply_succeeds() {
    let pipeline = Pipeline::new(1);
    let consumer = pipeline.start(PoisonPolicy::Block);

    pipeline.publish(ReviewEvent::created(7, "late@x.com", 5.0)).await;
    pipeline.publish(ReviewEvent::created(8, MENTOR, 4.0)).await;

    eventually("several attempts", || pipeline.store.apply_calls() >= 5).await;
    assert_eq!(pipeline.committed("7"), None);
    assert_eq!(pipeline.store.totals(MENTOR), (0.0, 0));
    assert!(pipeline.dead_letters.is_empty());

    pipeline.store.insert_mentor("late@x.com", "@late");
    eventually("partition unblocked", || pipeline.committed("7") == Some(2)).await;
    assert_eq!(pipeline.store.totals("late@x.com"), (5.0, 1));
    assert_eq!(pipeline.store.totals(MENTOR), (4.0, 1));

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_during_backoff_leaves_message_uncommitted() {
    let pipeline = Pipeline::new(1);
    let consumer = pipeline.start(PoisonPolicy::Block);

    pipeline.publish(ReviewEvent::created(7, "ghost@x.com", 5.0)).await;
    eventually("first attempt", || pipeline.store.apply_calls() >= 1).await;

    consumer.stop().await.unwrap();
    assert_eq!(pipeline.committed("7"), None);
}

#[tokio::test]
async fn readiness_and_lifecycle_states() {
    let pipeline = Pipeline::new(3);
    let mut consumer = pipeline.start(PoisonPolicy::default());

    let ready = tokio::time::timeout(Duration::from_secs(2), consumer.ready.wait())
        .await
        .expect("ready in time");
    assert!(ready);

    consumer
        .state
        .wait_for(|state| *state == ConsumerState::Consuming { partitions: vec![0, 1, 2] })
        .await
        .unwrap();
    assert_eq!(pipeline.bus.member_count(GROUP, TOPIC), 1);

    let mut state = consumer.state.clone();
    consumer.stop().await.unwrap();

    assert_eq!(*state.borrow_and_update(), ConsumerState::Stopped);
    assert_eq!(pipeline.bus.member_count(GROUP, TOPIC), 0);
}

#[tokio::test]
async fn rebalance_redelivers_uncommitted_messages() {
    let pipeline = Pipeline::new(2);
    let consumer = pipeline.start(PoisonPolicy::default());
    let mut ready = consumer.ready.clone();
    ready.wait().await;

    pipeline.bus.fail_commits(true);
    pipeline.publish(ReviewEvent::created(7, MENTOR, 4.0).with_seq(2)).await;
    eventually("first apply", || pipeline.store.apply_calls() == 1).await;

    pipeline.bus.trigger_rebalance();
    eventually("redelivery after rebalance", || pipeline.store.apply_calls() == 2).await;

    assert_eq!(pipeline.store.totals(MENTOR), (4.0, 1));
    assert_eq!(pipeline.committed("7"), None);
    assert_ne!(*consumer.state.borrow(), ConsumerState::Stopped);

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_mentors_keep_independent_totals() {
    let pipeline = Pipeline::new(4);
    let mentors = ["a@x.com", "b@x.com", "c@x.com"];
    for mentor in mentors {
        pipeline.store.insert_mentor(mentor, "@m");
    }
    let consumer = pipeline.start(PoisonPolicy::default());

    let mut review_id = 100;
    for round in 0..10u8 {
        for mentor in mentors {
            review_id += 1;
            let score = f32::from(round % 5 + 1);
            pipeline.publish(ReviewEvent::created(review_id, mentor, score).with_seq(2)).await;
        }
    }

    eventually("all applied", || {
        mentors.iter().all(|m| pipeline.store.totals(m).1 == 10)
    })
    .await;

    for mentor in mentors {
        // Two rounds of 1..=5.
        assert_eq!(pipeline.store.totals(mentor), (30.0, 10));
    }
    assert_eq!(pipeline.store.totals(MENTOR), (0.0, 0));

    consumer.stop().await.unwrap();
}
