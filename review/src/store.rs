//! Review persistence contract.

use crate::model::{NewReview, Review, ReviewChange, ReviewUpdate};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by review stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReviewStoreError {
    /// No review with this id (for this author, where scoped)
    #[error("Review not found: {0}")]
    NotFound(i64),

    /// The author already reviewed this mentor
    #[error("User {user_id} already reviewed {mentor_email}")]
    Duplicate {
        /// Author
        user_id: i64,
        /// Reviewed mentor
        mentor_email: String,
    },

    /// Connection or query failure
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Source of truth for reviews.
///
/// Every method commits before resolving. Events are published only after
/// that commit.
///
/// # Dyn Compatibility
///
/// Explicit `Pin<Box<dyn Future>>` returns so the store can be shared as
/// `Arc<dyn ReviewStore>`.
pub trait ReviewStore: Send + Sync {
    /// Id of the author's review of `mentor_email`, if any.
    ///
    /// # Errors
    ///
    /// [`ReviewStoreError::Storage`] on query failure.
    fn find_by_author(
        &self,
        user_id: i64,
        mentor_email: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, ReviewStoreError>> + Send + '_>>;

    /// Persist a new review at revision 1.
    ///
    /// # Errors
    ///
    /// [`ReviewStoreError::Duplicate`] if the author already reviewed the
    /// mentor, [`ReviewStoreError::Storage`] otherwise.
    fn insert(
        &self,
        review: NewReview,
    ) -> Pin<Box<dyn Future<Output = Result<Review, ReviewStoreError>> + Send + '_>>;

    /// Load a review.
    ///
    /// # Errors
    ///
    /// [`ReviewStoreError::Storage`] on query failure.
    fn get(&self, id: i64) -> Pin<Box<dyn Future<Output = Result<Option<Review>, ReviewStoreError>> + Send + '_>>;

    /// Replace the author's review `id` and bump its revision, returning the
    /// replaced and the new state read under the same lock or transaction.
    ///
    /// # Errors
    ///
    /// [`ReviewStoreError::NotFound`] if `id` does not exist or belongs to
    /// someone else, [`ReviewStoreError::Duplicate`] if moving to a mentor the
    /// author already reviewed.
    fn update(
        &self,
        id: i64,
        user_id: i64,
        update: ReviewUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<ReviewChange, ReviewStoreError>> + Send + '_>>;

    /// Delete the author's review `id`, returning its last state.
    ///
    /// # Errors
    ///
    /// [`ReviewStoreError::NotFound`] if `id` does not exist or belongs to
    /// someone else.
    fn delete(
        &self,
        id: i64,
        user_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Review, ReviewStoreError>> + Send + '_>>;

    /// Reviews of a mentor, newest first.
    ///
    /// # Errors
    ///
    /// [`ReviewStoreError::Storage`] on query failure.
    fn list_by_mentor(
        &self,
        mentor_email: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Review>, ReviewStoreError>> + Send + '_>>;
}
