//! In-memory [`ReviewStore`].

use crate::model::{NewReview, Review, ReviewChange, ReviewUpdate};
use crate::store::{ReviewStore, ReviewStoreError};
use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Reviews {
    next_id: i64,
    rows: BTreeMap<i64, Review>,
    write_failures_remaining: usize,
}

impl Reviews {
    fn author_review(&self, user_id: i64, mentor_email: &str) -> Option<i64> {
        self.rows
            .values()
            .find(|r| r.user_id == user_id && r.mentor_email == mentor_email)
            .map(|r| r.id)
    }

    fn take_failure(&mut self) -> Result<(), ReviewStoreError> {
        if self.write_failures_remaining > 0 {
            self.write_failures_remaining -= 1;
            return Err(ReviewStoreError::Storage("injected write failure".to_string()));
        }
        Ok(())
    }
}

/// Review store backed by a mutex-guarded map.
///
/// Enforces one review per `(user_id, mentor_email)` and author-scoped
/// updates and deletes, like the SQL store it stands in for.
#[derive(Clone, Default)]
pub struct InMemoryReviewStore {
    state: Arc<Mutex<Reviews>>,
}

impl InMemoryReviewStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a storage error.
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().write_failures_remaining = count;
    }

    /// Every stored review, by id.
    #[must_use]
    pub fn all(&self) -> Vec<Review> {
        self.lock().rows.values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Reviews> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ReviewStore for InMemoryReviewStore {
    fn find_by_author(
        &self,
        user_id: i64,
        mentor_email: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, ReviewStoreError>> + Send + '_>> {
        let mentor_email = mentor_email.to_string();
        Box::pin(async move { Ok(self.lock().author_review(user_id, &mentor_email)) })
    }

    fn insert(
        &self,
        review: NewReview,
    ) -> Pin<Box<dyn Future<Output = Result<Review, ReviewStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.take_failure()?;
            if state.author_review(review.user_id, &review.mentor_email).is_some() {
                return Err(ReviewStoreError::Duplicate {
                    user_id: review.user_id,
                    mentor_email: review.mentor_email,
                });
            }

            state.next_id += 1;
            let stored = Review {
                id: state.next_id,
                user_id: review.user_id,
                mentor_email: review.mentor_email,
                rating: review.rating,
                comment: review.comment,
                contact: review.contact,
                created_at: Utc::now(),
                revision: 1,
            };
            state.rows.insert(stored.id, stored.clone());
            Ok(stored)
        })
    }

    fn get(&self, id: i64) -> Pin<Box<dyn Future<Output = Result<Option<Review>, ReviewStoreError>> + Send + '_>> {
        Box::pin(async move { Ok(self.lock().rows.get(&id).cloned()) })
    }

    fn update(
        &self,
        id: i64,
        user_id: i64,
        update: ReviewUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<ReviewChange, ReviewStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.take_failure()?;
            if state
                .author_review(user_id, &update.mentor_email)
                .is_some_and(|existing| existing != id)
            {
                return Err(ReviewStoreError::Duplicate {
                    user_id,
                    mentor_email: update.mentor_email,
                });
            }

            let row = state
                .rows
                .get_mut(&id)
                .filter(|r| r.user_id == user_id)
                .ok_or(ReviewStoreError::NotFound(id))?;
            let before = row.clone();
            row.mentor_email = update.mentor_email;
            row.rating = update.rating;
            row.comment = update.comment;
            row.contact = update.contact;
            row.revision += 1;
            Ok(ReviewChange {
                before,
                after: row.clone(),
            })
        })
    }

    fn delete(
        &self,
        id: i64,
        user_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Review, ReviewStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.take_failure()?;
            if !state.rows.get(&id).is_some_and(|r| r.user_id == user_id) {
                return Err(ReviewStoreError::NotFound(id));
            }
            state.rows.remove(&id).ok_or(ReviewStoreError::NotFound(id))
        })
    }

    fn list_by_mentor(
        &self,
        mentor_email: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Review>, ReviewStoreError>> + Send + '_>> {
        let mentor_email = mentor_email.to_string();
        Box::pin(async move {
            let mut reviews: Vec<Review> = self
                .lock()
                .rows
                .values()
                .filter(|r| r.mentor_email == mentor_email)
                .cloned()
                .collect();
            reviews.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            Ok(reviews)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn new_review(user_id: i64, mentor_email: &str) -> NewReview {
        NewReview {
            user_id,
            mentor_email: mentor_email.to_string(),
            rating: 4.0,
            comment: "helpful".to_string(),
            contact: "@user".to_string(),
        }
    }

    #[tokio::test]
    async fn one_review_per_author_and_mentor() {
        let store = InMemoryReviewStore::new();
        let first = store.insert(new_review(1, "m@x.com")).await.unwrap();
        assert_eq!(first.revision, 1);

        let err = store.insert(new_review(1, "m@x.com")).await.unwrap_err();
        assert!(matches!(err, ReviewStoreError::Duplicate { user_id: 1, .. }));
        assert!(store.insert(new_review(2, "m@x.com")).await.is_ok());
        assert_eq!(store.find_by_author(1, "m@x.com").await.unwrap(), Some(first.id));
    }

    #[tokio::test]
    async fn updates_bump_revision_and_are_author_scoped() {
        let store = InMemoryReviewStore::new();
        let review = store.insert(new_review(1, "m@x.com")).await.unwrap();

        let change = store
            .update(review.id, 1, ReviewUpdate::rating_of(&review, 2.0))
            .await
            .unwrap();
        assert_eq!(change.before, review);
        assert_eq!(change.after.revision, 2);
        assert!((change.after.rating - 2.0).abs() < f32::EPSILON);

        let err = store
            .update(review.id, 2, ReviewUpdate::rating_of(&review, 1.0))
            .await
            .unwrap_err();
        assert_eq!(err, ReviewStoreError::NotFound(review.id));
        assert_eq!(store.delete(review.id, 2).await.unwrap_err(), ReviewStoreError::NotFound(review.id));

        let deleted = store.delete(review.id, 1).await.unwrap();
        assert_eq!(deleted.revision, 2);
        assert!(store.get(review.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_failures_leave_state_untouched() {
        let store = InMemoryReviewStore::new();
        store.fail_next_writes(1);

        assert!(matches!(
            store.insert(new_review(1, "m@x.com")).await,
            Err(ReviewStoreError::Storage(_))
        ));
        assert!(store.all().is_empty());
    }
}
