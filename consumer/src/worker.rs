//! Sequential processing of one partition.
//!
//! A worker handles its messages strictly in offset order. A message is
//! committed only once it was applied, dropped as undecodable, or parked in
//! the dead-letter sink. While a message keeps failing, nothing behind it on
//! the same partition moves.
//!
//! Only answers from the mentor service count toward the dead-letter budget.
//! Transport failures mean the service could not be reached, and the message
//! is retried for as long as the outage lasts.

use crate::retry::RetryPolicy;
use crate::shutdown::cancelled;
use chrono::Utc;
use mentor_rating_core::dead_letter::{DeadLetter, DeadLetterSink};
use mentor_rating_core::event::ReviewEvent;
use mentor_rating_core::event_bus::{ConsumerRecord, OffsetCommitter};
use mentor_rating_core::rpc::{RatingApplier, RatingRequest, RpcError};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// What happens to a message whose apply keeps failing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PoisonPolicy {
    /// Retry forever. The partition is blocked until the apply succeeds.
    #[default]
    Block,
    /// After `max_attempts` rejected applies, park the message in the
    /// dead-letter sink and commit it. Transport failures are not counted.
    DeadLetter {
        /// Rejected applies before the message is parked
        max_attempts: u32,
    },
}

impl PoisonPolicy {
    /// Whether `attempts` failures exhaust this policy.
    #[must_use]
    pub const fn is_exhausted(&self, attempts: u32) -> bool {
        match self {
            Self::Block => false,
            Self::DeadLetter { max_attempts } => attempts >= *max_attempts,
        }
    }
}

/// Collaborators shared by every partition worker of one consumer.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) applier: Arc<dyn RatingApplier>,
    pub(crate) dead_letters: Arc<dyn DeadLetterSink>,
    pub(crate) committer: Arc<dyn OffsetCommitter>,
    pub(crate) poison_policy: PoisonPolicy,
    pub(crate) retry_policy: RetryPolicy,
}

pub(crate) struct PartitionWorker {
    partition: i32,
    context: WorkerContext,
}

impl PartitionWorker {
    pub(crate) const fn new(partition: i32, context: WorkerContext) -> Self {
        Self { partition, context }
    }

    /// Handle messages until the queue closes or shutdown is requested.
    ///
    /// Shutdown is observed between messages and during retry backoff, never
    /// while an apply or commit is in flight.
    pub(crate) async fn run(
        self,
        mut messages: mpsc::Receiver<ConsumerRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::debug!(partition = self.partition, "Partition worker started");

        loop {
            let next = tokio::select! {
                biased;
                () = cancelled(&mut shutdown) => None,
                record = messages.recv() => record,
            };
            let Some(record) = next else { break };

            if self.handle(record, &mut shutdown).await.is_break() {
                break;
            }
        }

        tracing::debug!(partition = self.partition, "Partition worker stopped");
    }

    async fn handle(
        &self,
        record: ConsumerRecord,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ControlFlow<()> {
        let event = match decode(&record) {
            Ok(event) => event,
            Err(reason) => {
                tracing::warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    reason = %reason,
                    "Dropping undecodable review event"
                );
                metrics::counter!("review_events.dropped").increment(1);
                self.commit(&record);
                return ControlFlow::Continue(());
            },
        };

        let request = RatingRequest::from(&event);
        let mut failures: u32 = 0;
        let mut attempts: u32 = 0;
        let mut first_failure = None;

        loop {
            let error = match self.context.applier.apply(request.clone()).await {
                Ok(()) => {
                    tracing::info!(
                        partition = record.partition,
                        offset = record.offset,
                        action = %event.action,
                        review_id = event.review_id,
                        mentor_email = %event.mentor_email,
                        score = event.score,
                        "Review event applied"
                    );
                    metrics::counter!("review_events.applied", "action" => event.action.as_str())
                        .increment(1);
                    self.commit(&record);
                    return ControlFlow::Continue(());
                },
                Err(e) => e,
            };

            failures = failures.saturating_add(1);
            let counted = counts_toward_poison(&error);
            if counted {
                attempts = attempts.saturating_add(1);
            }
            let now = Utc::now();
            let first_failed_at = *first_failure.get_or_insert(now);

            tracing::warn!(
                partition = record.partition,
                offset = record.offset,
                review_id = event.review_id,
                mentor_email = %event.mentor_email,
                failures,
                attempts,
                error = %error,
                "Failed to apply review event"
            );

            if counted && self.context.poison_policy.is_exhausted(attempts) {
                let letter = DeadLetter {
                    record: record.clone(),
                    error_message: error.to_string(),
                    attempts,
                    first_failed_at,
                    last_failed_at: now,
                };
                match self.context.dead_letters.park(letter).await {
                    Ok(()) => {
                        metrics::counter!("review_events.dead_lettered").increment(1);
                        self.commit(&record);
                        return ControlFlow::Continue(());
                    },
                    Err(reason) => tracing::error!(
                        partition = record.partition,
                        offset = record.offset,
                        reason = %reason,
                        "Failed to park review event, keeping it uncommitted"
                    ),
                }
            }

            let delay = self.context.retry_policy.delay_for_attempt(failures - 1);
            tokio::select! {
                biased;
                () = cancelled(shutdown) => {
                    tracing::info!(
                        partition = record.partition,
                        offset = record.offset,
                        "Shutdown during retry backoff, message left uncommitted"
                    );
                    return ControlFlow::Break(());
                },
                () = tokio::time::sleep(delay) => {},
            }
        }
    }

    fn commit(&self, record: &ConsumerRecord) {
        if let Err(e) = self.context.committer.commit(record) {
            tracing::warn!(
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Offset commit failed, message may be redelivered"
            );
        }
    }
}

/// Whether a failed apply says something about the message itself.
const fn counts_toward_poison(error: &RpcError) -> bool {
    !matches!(error, RpcError::Transport(_))
}

fn decode(record: &ConsumerRecord) -> Result<ReviewEvent, String> {
    let payload = record
        .payload
        .as_deref()
        .ok_or_else(|| "message has no payload".to_string())?;
    ReviewEvent::from_json(payload).map_err(|e| e.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(payload: Option<&[u8]>) -> ConsumerRecord {
        ConsumerRecord {
            topic: "reviews".to_string(),
            partition: 0,
            offset: 3,
            key: Some("7".to_string()),
            payload: payload.map(<[u8]>::to_vec),
        }
    }

    #[test]
    fn poison_policy_limits() {
        assert!(!PoisonPolicy::Block.is_exhausted(u32::MAX));
        let policy = PoisonPolicy::DeadLetter { max_attempts: 3 };
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert_eq!(PoisonPolicy::default(), PoisonPolicy::Block);
    }

    #[test]
    fn only_service_answers_count_toward_poison() {
        assert!(!counts_toward_poison(&RpcError::Transport("connection refused".to_string())));
        assert!(counts_toward_poison(&RpcError::Rejected("mentor not found".to_string())));
        assert!(counts_toward_poison(&RpcError::Decode("bad body".to_string())));
    }

    #[test]
    fn decode_rejects_missing_and_unknown_payloads() {
        assert!(decode(&record(None)).is_err());
        assert!(decode(&record(Some(b"not json"))).is_err());
        assert!(
            decode(&record(Some(br#"{"action":"upvoted","id":7,"email":"m@x.com","score":1.0}"#))).is_err()
        );

        let event = decode(&record(Some(br#"{"action":"created","id":7,"email":"m@x.com","score":4.0}"#))).unwrap();
        assert_eq!(event, ReviewEvent::created(7, "m@x.com", 4.0));
    }
}
