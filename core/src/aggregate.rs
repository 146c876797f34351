//! Mentor rating aggregates and the store that owns them.
//!
//! A mentor's rating is kept as a running `(sum_rating, count_reviews)` pair.
//! The pair is never recomputed from reviews: it only moves through
//! [`AggregateStore::apply_delta`], which the store must execute as a single
//! atomic statement so concurrent deltas for one mentor serialize at the store.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::ops::Add;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by aggregate stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
    /// No aggregate row for this mentor.
    #[error("Mentor not found: {0}")]
    MentorNotFound(String),

    /// A mentor with this email is already registered.
    #[error("Mentor already exists: {0}")]
    MentorExists(String),

    /// The delta would break a store invariant (e.g. a negative review count).
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Connection or query failure.
    #[error("Database error: {0}")]
    Database(String),
}

/// A signed change to a mentor aggregate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Change to `sum_rating`.
    pub sum: f64,
    /// Change to `count_reviews`.
    pub count: i64,
}

impl Delta {
    /// `(+score, +1)`.
    #[must_use]
    pub fn add(score: f32) -> Self {
        Self {
            sum: f64::from(score),
            count: 1,
        }
    }

    /// `(-score, -1)`.
    #[must_use]
    pub fn retract(score: f32) -> Self {
        Self {
            sum: -f64::from(score),
            count: -1,
        }
    }

    /// True when the delta leaves an aggregate unchanged.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.count == 0 && self.sum.abs() < f64::EPSILON
    }
}

impl Add for Delta {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            sum: self.sum + rhs.sum,
            count: self.count + rhs.count,
        }
    }
}

/// Identifies one event of one review for replay detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventSequence {
    /// The review the event belongs to.
    pub review_id: i64,
    /// Monotonic position of the event within that review's history.
    pub seq: u64,
}

/// Result of a successful apply call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The delta changed the aggregate.
    Applied,
    /// The event's sequence number was already applied; nothing changed.
    Duplicate,
}

/// A mentor's running rating aggregate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MentorAggregate {
    /// Mentor identity and aggregate key.
    pub mentor_email: String,
    /// Free-form contact shown with the mentor.
    pub contact: String,
    /// Sum of all currently applied scores.
    pub sum_rating: f64,
    /// Number of currently applied reviews. Never negative.
    pub count_reviews: i64,
}

impl MentorAggregate {
    /// A freshly registered mentor with no reviews.
    #[must_use]
    pub fn new(mentor_email: impl Into<String>, contact: impl Into<String>) -> Self {
        Self {
            mentor_email: mentor_email.into(),
            contact: contact.into(),
            sum_rating: 0.0,
            count_reviews: 0,
        }
    }

    /// `sum_rating / count_reviews`, or 0 when there are no reviews.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // review counts stay far below 2^52
    pub fn average_rating(&self) -> f64 {
        if self.count_reviews <= 0 {
            0.0
        } else {
            self.sum_rating / self.count_reviews as f64
        }
    }

    /// Apply a delta in memory, enforcing `count_reviews >= 0`.
    ///
    /// Used by in-memory stores and tests; the Postgres store does the same
    /// arithmetic in SQL.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::ConstraintViolation`] if the count would go negative.
    pub fn apply(&mut self, delta: Delta) -> Result<(), AggregateError> {
        let count = self.count_reviews + delta.count;
        if count < 0 {
            return Err(AggregateError::ConstraintViolation(format!(
                "count_reviews for {} would become {count}",
                self.mentor_email
            )));
        }
        self.count_reviews = count;
        self.sum_rating += delta.sum;
        Ok(())
    }
}

/// Storage for mentor aggregates.
///
/// Implementations must make [`apply_delta`](Self::apply_delta) atomic per
/// call: two concurrent calls for the same mentor must both land.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the store can be shared as
/// `Arc<dyn AggregateStore>` between the service handlers.
pub trait AggregateStore: Send + Sync {
    /// Apply `delta` to the mentor's aggregate.
    ///
    /// When `sequence` is given, the store records it and turns a replay
    /// (`seq` not greater than the last applied one for that review) into
    /// [`ApplyOutcome::Duplicate`] without touching the aggregate.
    ///
    /// # Errors
    ///
    /// - [`AggregateError::MentorNotFound`] if the mentor is not registered
    /// - [`AggregateError::ConstraintViolation`] if the count would go negative
    /// - [`AggregateError::Database`] on storage failure
    fn apply_delta(
        &self,
        mentor_email: &str,
        delta: Delta,
        sequence: Option<EventSequence>,
    ) -> Pin<Box<dyn Future<Output = Result<ApplyOutcome, AggregateError>> + Send + '_>>;

    /// Register a mentor with an empty aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::MentorExists`] for a duplicate email.
    fn create_mentor(
        &self,
        mentor_email: &str,
        contact: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), AggregateError>> + Send + '_>>;

    /// Whether a mentor is registered.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::Database`] on storage failure.
    fn mentor_exists(
        &self,
        mentor_email: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, AggregateError>> + Send + '_>>;

    /// Load one aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::Database`] on storage failure.
    fn get_mentor(
        &self,
        mentor_email: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<MentorAggregate>, AggregateError>> + Send + '_>>;

    /// All aggregates, highest average rating first.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::Database`] on storage failure.
    fn list_mentors(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MentorAggregate>, AggregateError>> + Send + '_>>;
}
