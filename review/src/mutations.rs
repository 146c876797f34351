//! Review create, update and delete.
//!
//! Each mutation validates, commits to the [`ReviewStore`] and only then
//! publishes its events. A publish failure is logged by the producer and
//! does not change the result of the mutation.
//!
//! Updates and deletes of the same review hold a per-review lock from the
//! commit until their events are published, so the topic sees them in
//! revision order. The retract of an update is built from the state the
//! store replaced, never from an earlier read.

use crate::model::{self, NewReview, Review, ReviewChange, ReviewUpdate};
use crate::producer::ReviewEventProducer;
use crate::store::{ReviewStore, ReviewStoreError};
use mentor_rating_core::rpc::{MentorDirectory, RpcError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

/// Why a mutation was refused or failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReviewError {
    /// Input failed validation
    #[error("Invalid review: {0}")]
    Invalid(String),

    /// The mentor service does not know this mentor
    #[error("Mentor doesn't exist: {0}")]
    MentorNotFound(String),

    /// The author already reviewed this mentor
    #[error("Review already exists for user {user_id} and mentor {mentor_email}")]
    AlreadyReviewed {
        /// Author
        user_id: i64,
        /// Reviewed mentor
        mentor_email: String,
    },

    /// No such review
    #[error("Review not found: {0}")]
    NotFound(i64),

    /// The review belongs to another user
    #[error("User {user_id} does not own review {review_id}")]
    Forbidden {
        /// Review
        review_id: i64,
        /// Caller
        user_id: i64,
    },

    /// Mentor existence could not be checked
    #[error("Mentor check failed: {0}")]
    Directory(#[from] RpcError),

    /// The review store failed
    #[error("Review store error: {0}")]
    Store(String),
}

impl From<ReviewStoreError> for ReviewError {
    fn from(e: ReviewStoreError) -> Self {
        match e {
            ReviewStoreError::NotFound(id) => Self::NotFound(id),
            ReviewStoreError::Duplicate { user_id, mentor_email } => Self::AlreadyReviewed { user_id, mentor_email },
            ReviewStoreError::Storage(reason) => Self::Store(reason),
        }
    }
}

/// Async locks keyed by review id. Entries live only while someone holds
/// or waits for them.
#[derive(Default)]
struct ReviewLocks {
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl ReviewLocks {
    async fn acquire(&self, review_id: i64) -> ReviewLock<'_> {
        let lock = Arc::clone(self.map().entry(review_id).or_default());
        let guard = lock.lock_owned().await;
        ReviewLock {
            locks: self,
            review_id,
            guard: Some(guard),
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<i64, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ReviewLock<'a> {
    locks: &'a ReviewLocks,
    review_id: i64,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ReviewLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.locks.map();
        if map.get(&self.review_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(&self.review_id);
        }
    }
}

/// The review write path.
#[derive(Clone)]
pub struct ReviewMutations {
    store: Arc<dyn ReviewStore>,
    mentors: Arc<dyn MentorDirectory>,
    producer: ReviewEventProducer,
    locks: Arc<ReviewLocks>,
}

impl ReviewMutations {
    /// Write path over `store`, checking mentors through `mentors`.
    #[must_use]
    pub fn new(store: Arc<dyn ReviewStore>, mentors: Arc<dyn MentorDirectory>, producer: ReviewEventProducer) -> Self {
        Self {
            store,
            mentors,
            producer,
            locks: Arc::default(),
        }
    }

    /// Create a review and publish `created`.
    ///
    /// # Errors
    ///
    /// - [`ReviewError::Invalid`] for a malformed email or rating
    /// - [`ReviewError::MentorNotFound`] if the mentor is not registered
    /// - [`ReviewError::AlreadyReviewed`] if the author already reviewed the mentor
    /// - [`ReviewError::Directory`] / [`ReviewError::Store`] on collaborator failure
    pub async fn create(&self, review: NewReview) -> Result<Review, ReviewError> {
        model::validate(&review.mentor_email, review.rating).map_err(ReviewError::Invalid)?;
        self.require_mentor(&review.mentor_email).await?;

        if self.store.find_by_author(review.user_id, &review.mentor_email).await?.is_some() {
            tracing::warn!(user_id = review.user_id, mentor_email = %review.mentor_email, "Review already exists");
            return Err(ReviewError::AlreadyReviewed {
                user_id: review.user_id,
                mentor_email: review.mentor_email,
            });
        }

        let created = self.store.insert(review).await?;
        tracing::info!(review_id = created.id, mentor_email = %created.mentor_email, "Review created");

        // Failure is logged by the producer; the review stays created.
        let _ = self.producer.publish_created(&created).await;
        Ok(created)
    }

    /// Replace review `review_id` owned by `user_id`, then publish
    /// retract(old) and apply(new).
    ///
    /// # Errors
    ///
    /// - [`ReviewError::NotFound`] / [`ReviewError::Forbidden`] for a missing or foreign review
    /// - [`ReviewError::Invalid`], [`ReviewError::MentorNotFound`] and
    ///   [`ReviewError::AlreadyReviewed`] when moving to another mentor
    /// - [`ReviewError::Directory`] / [`ReviewError::Store`] on collaborator failure
    pub async fn update(&self, user_id: i64, review_id: i64, update: ReviewUpdate) -> Result<Review, ReviewError> {
        model::validate(&update.mentor_email, update.rating).map_err(ReviewError::Invalid)?;
        let current = self.owned_review(user_id, review_id).await?;

        if update.mentor_email != current.mentor_email {
            self.require_mentor(&update.mentor_email).await?;
        }

        let _serial = self.locks.acquire(review_id).await;
        let ReviewChange { before, after } = self.store.update(review_id, user_id, update).await?;
        tracing::info!(
            review_id,
            revision = after.revision,
            old_rating = before.rating,
            new_rating = after.rating,
            "Review updated"
        );

        let _ = self.producer.publish_updated(&before, &after).await;
        Ok(after)
    }

    /// Delete review `review_id` owned by `user_id`, then publish its retract.
    ///
    /// # Errors
    ///
    /// - [`ReviewError::NotFound`] / [`ReviewError::Forbidden`] for a missing or foreign review
    /// - [`ReviewError::Store`] on store failure
    pub async fn delete(&self, user_id: i64, review_id: i64) -> Result<Review, ReviewError> {
        self.owned_review(user_id, review_id).await?;

        let _serial = self.locks.acquire(review_id).await;
        let deleted = self.store.delete(review_id, user_id).await?;
        tracing::info!(review_id, mentor_email = %deleted.mentor_email, "Review deleted");

        let _ = self.producer.publish_deleted(&deleted).await;
        Ok(deleted)
    }

    /// Reviews of a mentor, newest first.
    ///
    /// # Errors
    ///
    /// [`ReviewError::Store`] on store failure.
    pub async fn reviews_of(&self, mentor_email: &str) -> Result<Vec<Review>, ReviewError> {
        Ok(self.store.list_by_mentor(mentor_email).await?)
    }

    async fn require_mentor(&self, mentor_email: &str) -> Result<(), ReviewError> {
        match self.mentors.check_mentor(mentor_email).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::warn!(mentor_email, "Mentor doesn't exist");
                Err(ReviewError::MentorNotFound(mentor_email.to_string()))
            },
            Err(e) => {
                tracing::error!(mentor_email, error = %e, "Failed to check mentor");
                Err(e.into())
            },
        }
    }

    async fn owned_review(&self, user_id: i64, review_id: i64) -> Result<Review, ReviewError> {
        let review = self
            .store
            .get(review_id)
            .await?
            .ok_or(ReviewError::NotFound(review_id))?;
        if review.user_id != user_id {
            tracing::warn!(review_id, user_id, "Review belongs to another user");
            return Err(ReviewError::Forbidden { review_id, user_id });
        }
        Ok(review)
    }
}
