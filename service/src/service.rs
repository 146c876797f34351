//! The mentor aggregate service.
//!
//! Resolves rating requests into deltas and hands them to the
//! [`AggregateStore`]. Used behind the HTTP router in production and called
//! in-process by tests.

use mentor_rating_core::aggregate::{AggregateError, AggregateStore, ApplyOutcome, EventSequence};
use mentor_rating_core::event::ReviewAction;
use mentor_rating_core::rpc::{
    CheckResponse, ListMentorsResponse, MentorDirectory, MentorRequest, MentorSummary,
    RatingApplier, RatingRequest, RpcError, RpcResponse,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Message of a rejected request with an action outside the closed set.
pub const ACTION_NOT_MATCHED: &str = "error: action don't matched";

/// Mentor aggregate operations over a shared store.
#[derive(Clone)]
pub struct AggregateService {
    store: Arc<dyn AggregateStore>,
}

impl AggregateService {
    /// Create a service over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn AggregateStore>) -> Self {
        Self { store }
    }

    /// Apply one rating request.
    ///
    /// Unknown actions and unknown mentors are rejected (`success = false`)
    /// without touching any aggregate. A replay of an already applied
    /// sequence number succeeds with message `duplicate`.
    ///
    /// # Errors
    ///
    /// Returns the store error for constraint violations and storage failures.
    pub async fn apply(&self, request: RatingRequest) -> Result<RpcResponse, AggregateError> {
        let Ok(action) = ReviewAction::parse(&request.action) else {
            tracing::warn!(action = %request.action, mentor_email = %request.mentor_email, "Unknown action rejected");
            return Ok(RpcResponse::rejected(ACTION_NOT_MATCHED));
        };

        let sequence = match (request.review_id, request.seq) {
            (Some(review_id), Some(seq)) => Some(EventSequence { review_id, seq }),
            _ => None,
        };
        let delta = action.delta(request.rating);

        match self.store.apply_delta(&request.mentor_email, delta, sequence).await {
            Ok(ApplyOutcome::Applied) => {
                tracing::debug!(
                    action = %action,
                    mentor_email = %request.mentor_email,
                    rating = request.rating,
                    "Rating delta applied"
                );
                metrics::counter!("mentor_aggregate.deltas", "action" => action.as_str()).increment(1);
                Ok(RpcResponse::ok("success"))
            },
            Ok(ApplyOutcome::Duplicate) => {
                tracing::info!(
                    mentor_email = %request.mentor_email,
                    review_id = ?request.review_id,
                    seq = ?request.seq,
                    "Replayed rating request skipped"
                );
                Ok(RpcResponse::ok("duplicate"))
            },
            Err(AggregateError::MentorNotFound(email)) => {
                tracing::warn!(mentor_email = %email, "Rating for unknown mentor rejected");
                Ok(RpcResponse::rejected(format!("mentor not found: {email}")))
            },
            Err(e) => {
                tracing::error!(mentor_email = %request.mentor_email, error = %e, "Failed to apply rating delta");
                Err(e)
            },
        }
    }

    /// Whether a mentor is registered.
    ///
    /// # Errors
    ///
    /// Returns the store error on lookup failure.
    pub async fn check_mentor(&self, mentor_email: &str) -> Result<CheckResponse, AggregateError> {
        let exists = self.store.mentor_exists(mentor_email).await?;
        Ok(CheckResponse {
            success: true,
            exists,
            message: if exists { "mentor exists" } else { "mentor not found" }.to_string(),
        })
    }

    /// Register a mentor. A duplicate email is rejected.
    ///
    /// # Errors
    ///
    /// Returns the store error on storage failure.
    pub async fn new_mentor(&self, request: MentorRequest) -> Result<RpcResponse, AggregateError> {
        match self.store.create_mentor(&request.mentor_email, &request.contact).await {
            Ok(()) => Ok(RpcResponse::ok("mentor created")),
            Err(AggregateError::MentorExists(email)) => {
                Ok(RpcResponse::rejected(format!("mentor already exists: {email}")))
            },
            Err(e) => Err(e),
        }
    }

    /// All mentors, highest average rating first.
    ///
    /// # Errors
    ///
    /// Returns the store error on query failure.
    pub async fn list_mentors(&self) -> Result<ListMentorsResponse, AggregateError> {
        let mentors = self
            .store
            .list_mentors()
            .await?
            .into_iter()
            .map(|m| MentorSummary {
                average_rating: m.average_rating(),
                mentor_email: m.mentor_email,
                contact: m.contact,
                count_reviews: m.count_reviews,
            })
            .collect();

        Ok(ListMentorsResponse { mentors })
    }
}

impl RatingApplier for AggregateService {
    fn apply(
        &self,
        request: RatingRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), RpcError>> + Send + '_>> {
        Box::pin(async move {
            match AggregateService::apply(self, request).await {
                Ok(response) if response.success => Ok(()),
                Ok(response) => Err(RpcError::Rejected(response.message)),
                Err(e) => Err(RpcError::Transport(e.to_string())),
            }
        })
    }
}

impl MentorDirectory for AggregateService {
    fn check_mentor(
        &self,
        mentor_email: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, RpcError>> + Send + '_>> {
        let mentor_email = mentor_email.to_string();
        Box::pin(async move {
            AggregateService::check_mentor(self, &mentor_email)
                .await
                .map(|response| response.exists)
                .map_err(|e| RpcError::Transport(e.to_string()))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use mentor_rating_testing::InMemoryAggregateStore;

    fn service() -> (AggregateService, InMemoryAggregateStore) {
        let store = InMemoryAggregateStore::new();
        store.insert_mentor("m@x.com", "@m");
        (AggregateService::new(Arc::new(store.clone())), store)
    }

    #[tokio::test]
    async fn created_and_deleted_move_the_aggregate() {
        let (service, store) = service();

        let created = service.apply(RatingRequest::new(ReviewAction::Created, "m@x.com", 4.0)).await.unwrap();
        assert!(created.success);
        assert_eq!(store.totals("m@x.com"), (4.0, 1));

        service.apply(RatingRequest::new(ReviewAction::Deleted, "m@x.com", 4.0)).await.unwrap();
        assert_eq!(store.totals("m@x.com"), (0.0, 0));
    }

    #[tokio::test]
    async fn unknown_action_is_rejected_without_mutation() {
        let (service, store) = service();
        let mut request = RatingRequest::new(ReviewAction::Created, "m@x.com", 4.0);
        request.action = "upvoted".to_string();

        let response = service.apply(request).await.unwrap();

        assert_eq!(response, RpcResponse::rejected(ACTION_NOT_MATCHED));
        assert_eq!(store.totals("m@x.com"), (0.0, 0));
        assert_eq!(store.apply_calls(), 0);
    }

    #[tokio::test]
    async fn unknown_mentor_is_rejected() {
        let (service, _) = service();
        let response = service
            .apply(RatingRequest::new(ReviewAction::Created, "ghost@x.com", 4.0))
            .await
            .unwrap();

        assert!(!response.success);
    }

    #[tokio::test]
    async fn replay_with_sequence_is_reported_as_duplicate() {
        let (service, store) = service();
        let mut request = RatingRequest::new(ReviewAction::Created, "m@x.com", 4.0);
        request.review_id = Some(7);
        request.seq = Some(2);

        service.apply(request.clone()).await.unwrap();
        let replay = service.apply(request).await.unwrap();

        assert_eq!(replay, RpcResponse::ok("duplicate"));
        assert_eq!(store.totals("m@x.com"), (4.0, 1));
    }

    #[tokio::test]
    async fn constraint_violation_is_a_store_error() {
        let (service, _) = service();
        let err = service
            .apply(RatingRequest::new(ReviewAction::Deleted, "m@x.com", 4.0))
            .await
            .unwrap_err();

        assert!(matches!(err, AggregateError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn in_process_applier_maps_rejection_and_store_failure() {
        let (service, store) = service();
        let applier: &dyn RatingApplier = &service;

        let rejected = applier
            .apply(RatingRequest::new(ReviewAction::Created, "ghost@x.com", 1.0))
            .await
            .unwrap_err();
        assert!(matches!(rejected, RpcError::Rejected(_)));

        store.fail_next_applies(1);
        let failed = applier
            .apply(RatingRequest::new(ReviewAction::Created, "m@x.com", 1.0))
            .await
            .unwrap_err();
        assert!(matches!(failed, RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn new_mentor_rejects_duplicates_and_listing_is_ordered() {
        let (service, _) = service();
        let request = MentorRequest {
            mentor_email: "top@x.com".to_string(),
            contact: "@top".to_string(),
        };

        assert!(service.new_mentor(request.clone()).await.unwrap().success);
        assert!(!service.new_mentor(request).await.unwrap().success);

        service.apply(RatingRequest::new(ReviewAction::Created, "top@x.com", 5.0)).await.unwrap();
        service.apply(RatingRequest::new(ReviewAction::Created, "m@x.com", 3.0)).await.unwrap();

        let listing = service.list_mentors().await.unwrap();
        assert_eq!(listing.mentors[0].mentor_email, "top@x.com");
        assert_eq!(listing.mentors[0].average_rating, 5.0);
        assert!(service.check_mentor("top@x.com").await.unwrap().exists);
    }
}
