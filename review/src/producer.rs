//! Publishes review events after the review store committed.
//!
//! # Sequence numbers
//!
//! Every event carries `seq`, derived from the review revision `r` it was
//! emitted for, so the aggregate store can skip replays:
//!
//! | Mutation          | Events                                   |
//! |-------------------|------------------------------------------|
//! | create (`r = 1`)  | `created` seq 2                          |
//! | update to `r`     | `deleted` seq `2r-1`, `updated` seq `2r` |
//! | delete at `r`     | `deleted` seq `2r+1`                     |
//!
//! Numbers grow strictly along the life of a review.

use crate::model::Review;
use mentor_rating_core::event::ReviewEvent;
use mentor_rating_core::event_bus::{Delivery, EventBus, EventBusError};
use std::sync::Arc;

/// Sequence number of the apply event for revision `revision`.
#[must_use]
pub const fn apply_seq(revision: i64) -> u64 {
    revision_index(revision).saturating_mul(2)
}

/// Sequence number of the retract event of an update to `revision`.
#[must_use]
pub const fn retract_seq(revision: i64) -> u64 {
    apply_seq(revision).saturating_sub(1)
}

/// Sequence number of the retract event of a delete at `revision`.
#[must_use]
pub const fn delete_seq(revision: i64) -> u64 {
    apply_seq(revision).saturating_add(1)
}

const fn revision_index(revision: i64) -> u64 {
    if revision < 1 { 1 } else { revision.unsigned_abs() }
}

/// Review event producer.
///
/// Failures are logged and counted here and returned for inspection; the
/// write path never turns them into a failed mutation.
#[derive(Clone)]
pub struct ReviewEventProducer {
    bus: Arc<dyn EventBus>,
    topic: String,
}

impl ReviewEventProducer {
    /// Producer publishing to `topic` on `bus`.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
        }
    }

    /// Target topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish the `created` event of a new review.
    ///
    /// # Errors
    ///
    /// The publish error, already logged.
    pub async fn publish_created(&self, review: &Review) -> Result<(), EventBusError> {
        let event = ReviewEvent::created(review.id, &review.mentor_email, review.rating)
            .with_seq(apply_seq(review.revision));
        self.publish(&event).await.map(|_| ())
    }

    /// Publish retract(`before`) then apply(`after`).
    ///
    /// The apply event is sent only after the retract was acknowledged. If
    /// the retract fails the apply is skipped, so the aggregate keeps the old
    /// score instead of counting the review twice.
    ///
    /// # Errors
    ///
    /// The first publish error, already logged.
    pub async fn publish_updated(&self, before: &Review, after: &Review) -> Result<(), EventBusError> {
        let retract = ReviewEvent::deleted(before.id, &before.mentor_email, before.rating)
            .with_seq(retract_seq(after.revision));
        let apply = ReviewEvent::updated(after.id, &after.mentor_email, after.rating)
            .with_seq(apply_seq(after.revision));

        if let Err(e) = self.publish(&retract).await {
            tracing::warn!(
                review_id = after.id,
                revision = after.revision,
                "Retract not published, skipping apply event"
            );
            return Err(e);
        }
        self.publish(&apply).await.map(|_| ())
    }

    /// Publish the retract event of a deleted review.
    ///
    /// # Errors
    ///
    /// The publish error, already logged.
    pub async fn publish_deleted(&self, review: &Review) -> Result<(), EventBusError> {
        let event = ReviewEvent::deleted(review.id, &review.mentor_email, review.rating)
            .with_seq(delete_seq(review.revision));
        self.publish(&event).await.map(|_| ())
    }

    async fn publish(&self, event: &ReviewEvent) -> Result<Delivery, EventBusError> {
        let payload = event.to_json().map_err(|e| EventBusError::PublishFailed {
            topic: self.topic.clone(),
            reason: e.to_string(),
        });
        let result = match payload {
            Ok(payload) => self.bus.publish(&self.topic, &event.partition_key(), &payload).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(delivery) => {
                tracing::debug!(
                    topic = %self.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    action = %event.action,
                    review_id = event.review_id,
                    seq = ?event.seq,
                    "Review event published"
                );
                metrics::counter!("review_events.published", "action" => event.action.as_str()).increment(1);
            },
            Err(e) => {
                tracing::error!(
                    topic = %self.topic,
                    action = %event.action,
                    review_id = event.review_id,
                    mentor_email = %event.mentor_email,
                    error = %e,
                    "Failed to publish review event"
                );
                metrics::counter!("review_events.publish_failed", "action" => event.action.as_str()).increment(1);
            },
        }
        result
    }
}
