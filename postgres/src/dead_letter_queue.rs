//! Dead Letter Queue for review events.
//!
//! The consumer parks a message here once it has failed its apply attempts,
//! then commits it. Entries keep the raw payload and broker coordinates so an
//! operator can inspect, replay or discard them.

use chrono::{DateTime, Utc};
use mentor_rating_core::dead_letter::{DeadLetter, DeadLetterSink};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by the Dead Letter Queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterQueueError {
    /// Query failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Unknown value in the `status` column.
    #[error("Invalid DLQ status: {0}")]
    InvalidStatus(String),
}

/// Status of a parked event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Waiting for investigation
    Pending,
    /// Being replayed
    Processing,
    /// Replayed successfully
    Resolved,
    /// Given up on
    Discarded,
}

impl DLQStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse the database representation.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterQueueError::InvalidStatus`] for unknown values.
    pub fn parse(s: &str) -> Result<Self, DeadLetterQueueError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(DeadLetterQueueError::InvalidStatus(s.to_string())),
        }
    }
}

/// A row of `failed_review_events`.
#[derive(Debug, Clone)]
pub struct FailedReviewEvent {
    /// Entry id
    pub id: i64,
    /// Topic the message was read from
    pub topic: String,
    /// Partition the message was read from
    pub partition: i32,
    /// Offset of the message
    pub offset: i64,
    /// Message key (the review id)
    pub message_key: Option<String>,
    /// Raw payload
    pub payload: Option<Vec<u8>>,
    /// Last error seen
    pub error_message: String,
    /// Apply attempts made before parking
    pub attempts: i32,
    /// First failure
    pub first_failed_at: DateTime<Utc>,
    /// Last failure
    pub last_failed_at: DateTime<Utc>,
    /// Current status
    pub status: DLQStatus,
    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it
    pub resolved_by: Option<String>,
    /// Free-form notes
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-backed Dead Letter Queue.
///
/// # Example
///
/// ```no_run
/// use mentor_rating_postgres::DeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// for entry in dlq.list_pending(100).await? {
///     println!("{}[{}]@{}: {}", entry.topic, entry.partition, entry.offset, entry.error_message);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a queue over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Park a message.
    ///
    /// Parking the same `(topic, partition, offset)` twice updates the
    /// existing entry, so a crash between parking and committing does not
    /// produce a second row.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterQueueError::Database`] if the insert fails.
    pub async fn add_entry(&self, letter: &DeadLetter) -> Result<i64, DeadLetterQueueError> {
        let attempts = i32::try_from(letter.attempts).unwrap_or(i32::MAX);

        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_review_events (
                topic, partition_id, message_offset, message_key, payload,
                error_message, attempts, first_failed_at, last_failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (topic, partition_id, message_offset) DO UPDATE
            SET error_message = EXCLUDED.error_message,
                attempts = failed_review_events.attempts + EXCLUDED.attempts,
                last_failed_at = EXCLUDED.last_failed_at,
                status = 'pending'
            RETURNING id
            ",
        )
        .bind(&letter.record.topic)
        .bind(letter.record.partition)
        .bind(letter.record.offset)
        .bind(letter.record.key.as_deref())
        .bind(letter.record.payload.as_deref())
        .bind(&letter.error_message)
        .bind(attempts)
        .bind(letter.first_failed_at)
        .bind(letter.last_failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DeadLetterQueueError::Database(e.to_string()))?;

        tracing::warn!(
            dlq_id = id,
            topic = %letter.record.topic,
            partition = letter.record.partition,
            offset = letter.record.offset,
            error = %letter.error_message,
            attempts,
            "Review event added to Dead Letter Queue"
        );

        metrics::counter!("dead_letter_queue.added", "topic" => letter.record.topic.clone())
            .increment(1);

        Ok(id)
    }

    /// Pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterQueueError::Database`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedReviewEvent>, DeadLetterQueueError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// Entries with `status`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterQueueError::Database`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedReviewEvent>, DeadLetterQueueError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r"
            SELECT
                id, topic, partition_id, message_offset, message_key, payload,
                error_message, attempts, first_failed_at, last_failed_at, status,
                resolved_at, resolved_by, resolution_notes
            FROM failed_review_events
            WHERE status = $1
            ORDER BY first_failed_at ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DeadLetterQueueError::Database(e.to_string()))?;

        rows.iter().map(Self::row_to_failed_event).collect()
    }

    /// Change the status of an entry.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterQueueError::Database`] if the update fails.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), DeadLetterQueueError> {
        sqlx::query("UPDATE failed_review_events SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DeadLetterQueueError::Database(e.to_string()))?;

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");
        Ok(())
    }

    /// Mark an entry as replayed.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterQueueError::Database`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DeadLetterQueueError> {
        sqlx::query(
            r"
            UPDATE failed_review_events
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DeadLetterQueueError::Database(e.to_string()))?;

        tracing::info!(dlq_id = id, resolved_by, "DLQ entry marked as resolved");
        metrics::counter!("dead_letter_queue.resolved").increment(1);
        Ok(())
    }

    /// Give up on an entry.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterQueueError::Database`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), DeadLetterQueueError> {
        sqlx::query(
            r"
            UPDATE failed_review_events
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DeadLetterQueueError::Database(e.to_string()))?;

        tracing::warn!(dlq_id = id, reason, "DLQ entry marked as discarded");
        metrics::counter!("dead_letter_queue.discarded").increment(1);
        Ok(())
    }

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterQueueError::Database`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, DeadLetterQueueError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_review_events WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| DeadLetterQueueError::Database(e.to_string()))?;

        Ok(count)
    }

    fn row_to_failed_event(row: &sqlx::postgres::PgRow) -> Result<FailedReviewEvent, DeadLetterQueueError> {
        let status: String = row.get("status");

        Ok(FailedReviewEvent {
            id: row.get("id"),
            topic: row.get("topic"),
            partition: row.get("partition_id"),
            offset: row.get("message_offset"),
            message_key: row.get("message_key"),
            payload: row.get("payload"),
            error_message: row.get("error_message"),
            attempts: row.get("attempts"),
            first_failed_at: row.get("first_failed_at"),
            last_failed_at: row.get("last_failed_at"),
            status: DLQStatus::parse(&status)?,
            resolved_at: row.get("resolved_at"),
            resolved_by: row.get("resolved_by"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn park(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(async move {
            self.add_entry(&letter).await.map(|_| ()).map_err(|e| e.to_string())
        })
    }
}
