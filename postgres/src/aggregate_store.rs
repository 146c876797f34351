//! Mentor aggregates in `PostgreSQL`.
//!
//! Every delta is a single `UPDATE ... SET col = col + $n`, so concurrent
//! deltas for one mentor serialize on the row lock and none is lost. When the
//! caller supplies an [`EventSequence`], the sequence claim in
//! `applied_review_events` and the delta run in one transaction.

use mentor_rating_core::aggregate::{
    AggregateError, AggregateStore, ApplyOutcome, Delta, EventSequence, MentorAggregate,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::future::Future;
use std::pin::Pin;

const CHECK_VIOLATION: &str = "23514";
const UNIQUE_VIOLATION: &str = "23505";

/// `PostgreSQL`-backed [`AggregateStore`].
#[derive(Clone)]
pub struct PostgresAggregateStore {
    pool: PgPool,
}

impl PostgresAggregateStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn sql_state(error: &sqlx::Error) -> Option<String> {
    error
        .as_database_error()
        .and_then(|db| db.code())
        .map(std::borrow::Cow::into_owned)
}

fn map_delta_error(mentor_email: &str, error: &sqlx::Error) -> AggregateError {
    if sql_state(error).as_deref() == Some(CHECK_VIOLATION) {
        AggregateError::ConstraintViolation(format!(
            "count_reviews for {mentor_email} would become negative"
        ))
    } else {
        AggregateError::Database(error.to_string())
    }
}

fn db_error(error: &sqlx::Error) -> AggregateError {
    AggregateError::Database(error.to_string())
}

fn row_to_aggregate(row: &PgRow) -> MentorAggregate {
    MentorAggregate {
        mentor_email: row.get("mentor_email"),
        contact: row.get("contact"),
        sum_rating: row.get("sum_rating"),
        count_reviews: row.get("count_reviews"),
    }
}

/// Claim `sequence` for its review. `false` if it was already applied.
async fn claim_sequence(
    tx: &mut Transaction<'_, Postgres>,
    sequence: EventSequence,
) -> Result<bool, AggregateError> {
    let seq = i64::try_from(sequence.seq).map_err(|_| {
        AggregateError::ConstraintViolation(format!("sequence {} out of range", sequence.seq))
    })?;

    let claimed: Option<(i64,)> = sqlx::query_as(
        r"
        INSERT INTO applied_review_events (review_id, last_seq)
        VALUES ($1, $2)
        ON CONFLICT (review_id) DO UPDATE
        SET last_seq = EXCLUDED.last_seq, applied_at = NOW()
        WHERE applied_review_events.last_seq < EXCLUDED.last_seq
        RETURNING review_id
        ",
    )
    .bind(sequence.review_id)
    .bind(seq)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| db_error(&e))?;

    Ok(claimed.is_some())
}

/// The delta itself. Returns the number of rows touched (0 or 1).
async fn update_totals<'e, E>(executor: E, mentor_email: &str, delta: Delta) -> Result<u64, AggregateError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r"
        UPDATE mentors
        SET sum_rating = sum_rating + $1,
            count_reviews = count_reviews + $2
        WHERE mentor_email = $3
        ",
    )
    .bind(delta.sum)
    .bind(delta.count)
    .bind(mentor_email)
    .execute(executor)
    .await
    .map_err(|e| map_delta_error(mentor_email, &e))?;

    Ok(result.rows_affected())
}

impl AggregateStore for PostgresAggregateStore {
    fn apply_delta(
        &self,
        mentor_email: &str,
        delta: Delta,
        sequence: Option<EventSequence>,
    ) -> Pin<Box<dyn Future<Output = Result<ApplyOutcome, AggregateError>> + Send + '_>> {
        let mentor_email = mentor_email.to_string();

        Box::pin(async move {
            let Some(sequence) = sequence else {
                let updated = update_totals(&self.pool, &mentor_email, delta).await?;
                if updated == 0 {
                    return Err(AggregateError::MentorNotFound(mentor_email));
                }
                return Ok(ApplyOutcome::Applied);
            };

            let mut tx = self.pool.begin().await.map_err(|e| db_error(&e))?;

            if !claim_sequence(&mut tx, sequence).await? {
                tracing::debug!(
                    mentor_email = %mentor_email,
                    review_id = sequence.review_id,
                    seq = sequence.seq,
                    "Replayed review event skipped"
                );
                return Ok(ApplyOutcome::Duplicate);
            }

            // Dropping the transaction on any error below rolls back the claim.
            let updated = update_totals(&mut *tx, &mentor_email, delta).await?;
            if updated == 0 {
                return Err(AggregateError::MentorNotFound(mentor_email));
            }

            tx.commit().await.map_err(|e| db_error(&e))?;
            Ok(ApplyOutcome::Applied)
        })
    }

    fn create_mentor(
        &self,
        mentor_email: &str,
        contact: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), AggregateError>> + Send + '_>> {
        let mentor_email = mentor_email.to_string();
        let contact = contact.to_string();

        Box::pin(async move {
            sqlx::query("INSERT INTO mentors (mentor_email, contact) VALUES ($1, $2)")
                .bind(&mentor_email)
                .bind(&contact)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    if sql_state(&e).as_deref() == Some(UNIQUE_VIOLATION) {
                        AggregateError::MentorExists(mentor_email.clone())
                    } else {
                        db_error(&e)
                    }
                })?;

            tracing::info!(mentor_email = %mentor_email, "Mentor registered");
            Ok(())
        })
    }

    fn mentor_exists(
        &self,
        mentor_email: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, AggregateError>> + Send + '_>> {
        let mentor_email = mentor_email.to_string();

        Box::pin(async move {
            let (exists,): (bool,) =
                sqlx::query_as("SELECT EXISTS (SELECT 1 FROM mentors WHERE mentor_email = $1)")
                    .bind(&mentor_email)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| db_error(&e))?;
            Ok(exists)
        })
    }

    fn get_mentor(
        &self,
        mentor_email: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<MentorAggregate>, AggregateError>> + Send + '_>> {
        let mentor_email = mentor_email.to_string();

        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT mentor_email, contact, sum_rating, count_reviews
                FROM mentors
                WHERE mentor_email = $1
                ",
            )
            .bind(&mentor_email)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error(&e))?;

            Ok(row.as_ref().map(row_to_aggregate))
        })
    }

    fn list_mentors(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MentorAggregate>, AggregateError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT mentor_email, contact, sum_rating, count_reviews
                FROM mentors
                ORDER BY average_rating DESC, mentor_email ASC
                ",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error(&e))?;

            Ok(rows.iter().map(row_to_aggregate).collect())
        })
    }
}
