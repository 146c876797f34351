//! Integration tests for [`RedpandaEventBus`] against a real Kafka broker.
//!
//! Marked `#[ignore]`: they need Docker (testcontainers) and take tens of
//! seconds to start the broker.
//!
//! ```bash
//! cargo test -p mentor-rating-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use futures::StreamExt;
use mentor_rating_core::event_bus::{BusEvent, ConsumerRecord, EventBus, Subscription};
use mentor_rating_redpanda::RedpandaEventBus;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");

    wait_for_kafka_ready(&brokers).await;
    (kafka, brokers)
}

async fn wait_for_kafka_ready(brokers: &str) {
    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        if let Ok(bus) = RedpandaEventBus::new(brokers) {
            if bus.publish("warmup-topic", "warmup", b"{}").await.is_ok() {
                tokio::time::sleep(Duration::from_millis(500)).await;
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            attempt != max_attempts,
            "Kafka failed to become ready after {max_attempts} attempts"
        );
    }
}

/// Read messages until `count` have arrived, skipping rebalance notifications.
async fn next_messages(subscription: &mut Subscription, count: usize) -> Vec<ConsumerRecord> {
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(20), async {
        while received.len() < count {
            match subscription.events.next().await {
                Some(Ok(BusEvent::Message(record))) => received.push(record),
                Some(Ok(_) | Err(_)) => {},
                None => panic!("subscription ended"),
            }
        }
    })
    .await
    .expect("Timeout waiting for messages");
    received
}

#[tokio::test]
#[ignore]
async fn same_key_messages_arrive_in_publish_order() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = RedpandaEventBus::new(&brokers).expect("Failed to create bus");

    let mut partitions = Vec::new();
    for score in 1..=5 {
        let payload = format!(r#"{{"action":"updated","id":7,"email":"m@x.com","score":{score}.0}}"#);
        let delivery = bus
            .publish("ordered-reviews", "7", payload.as_bytes())
            .await
            .expect("Failed to publish");
        partitions.push(delivery.partition);
    }
    assert!(partitions.windows(2).all(|w| w[0] == w[1]));

    let mut subscription = bus
        .subscribe("ordered-reviews", "ordering-test")
        .await
        .expect("Failed to subscribe");
    let records = next_messages(&mut subscription, 5).await;

    let offsets: Vec<i64> = records.iter().map(|r| r.offset).collect();
    let mut sorted = offsets.clone();
    sorted.sort_unstable();
    assert_eq!(offsets, sorted);
    assert!(records.iter().all(|r| r.key.as_deref() == Some("7")));
}

#[tokio::test]
#[ignore]
async fn uncommitted_messages_are_redelivered_to_the_next_member() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = RedpandaEventBus::new(&brokers).expect("Failed to create bus");

    bus.publish("redelivery-reviews", "1", b"first").await.expect("publish");
    bus.publish("redelivery-reviews", "1", b"second").await.expect("publish");

    {
        let mut subscription = bus
            .subscribe("redelivery-reviews", "redelivery-test")
            .await
            .expect("Failed to subscribe");
        let records = next_messages(&mut subscription, 2).await;
        subscription.committer.commit(&records[0]).expect("commit");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let mut subscription = bus
        .subscribe("redelivery-reviews", "redelivery-test")
        .await
        .expect("Failed to re-subscribe");
    let records = next_messages(&mut subscription, 1).await;

    assert_eq!(records[0].payload.as_deref(), Some(&b"second"[..]));
}

#[tokio::test]
#[ignore]
async fn assignment_is_reported_before_messages() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = RedpandaEventBus::new(&brokers).expect("Failed to create bus");
    bus.publish("assigned-reviews", "3", b"payload").await.expect("publish");

    let mut subscription = bus
        .subscribe("assigned-reviews", "assignment-test")
        .await
        .expect("Failed to subscribe");

    let first = tokio::time::timeout(Duration::from_secs(20), subscription.events.next())
        .await
        .expect("Timeout waiting for assignment")
        .expect("subscription ended")
        .expect("transport error");

    assert!(matches!(first, BusEvent::Assigned(ref partitions) if !partitions.is_empty()));
}
